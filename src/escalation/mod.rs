//! Escalation channels and the finalization pass.
//!
//! Every isolation domain owns one [`EscalationChannel`]; the host owns
//! another. Units spawned on a channel are tracked by it until a
//! finalization pass reclaims them. For each reclaimed unit that faulted
//! and was never observed, the pass fires one [`EscalationEvent`] at the
//! monitors that were subscribed when the fault happened. A failure still
//! unobserved after that is fatal.

pub mod monitor;
pub mod unit;

use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

pub use monitor::{AsyncFailureMonitor, FailureLog};
pub use unit::{Failure, Task};
use unit::UnitCell;

/// Callback invoked for each escalation on a channel.
pub type MonitorFn = Arc<dyn Fn(&EscalationEvent<'_>) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot notification for a faulted, unreferenced unit.
pub struct EscalationEvent<'a> {
    channel: &'a str,
    unit_id: u64,
    unit_name: &'a str,
    failure: &'a Failure,
    observed: &'a AtomicBool,
}

impl EscalationEvent<'_> {
    pub fn channel(&self) -> &str {
        self.channel
    }

    pub fn unit_id(&self) -> u64 {
        self.unit_id
    }

    pub fn unit_name(&self) -> &str {
        self.unit_name
    }

    pub fn failure(&self) -> &Failure {
        self.failure
    }

    /// Suppresses fatal propagation. Cannot be undone.
    pub fn set_observed(&self) {
        self.observed.store(true, Ordering::Release);
    }

    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }
}

/// Counters for one or more finalization passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Units dropped from tracking (completed or faulted)
    pub reclaimed: usize,
    /// Escalation events fired
    pub escalated: usize,
    /// Escalations a monitor marked observed
    pub observed: usize,
}

impl AddAssign for ReapReport {
    fn add_assign(&mut self, rhs: Self) {
        self.reclaimed += rhs.reclaimed;
        self.escalated += rhs.escalated;
        self.observed += rhs.observed;
    }
}

/// Faults that reached a finalization pass with nobody to observe them.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "{} unobserved background failure(s) on channel '{channel}'{}",
    .failures.len(),
    first_failure_suffix(.failures)
)]
pub struct UnobservedAsyncFailure {
    pub channel: String,
    pub failures: Vec<Failure>,
}

fn first_failure_suffix(failures: &[Failure]) -> String {
    failures
        .first()
        .map(|first| format!(": {first}"))
        .unwrap_or_default()
}

/// Per-context failure escalation channel.
pub struct EscalationChannel {
    name: String,
    /// Append-only; a unit snapshots the length when it faults
    monitors: Arc<RwLock<Vec<MonitorFn>>>,
    units: Mutex<Vec<Arc<UnitCell>>>,
    next_id: AtomicU64,
}

impl EscalationChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            monitors: Arc::new(RwLock::new(Vec::new())),
            units: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a monitor. It only sees faults that happen after this call.
    pub fn subscribe<F>(&self, monitor: F)
    where
        F: Fn(&EscalationEvent<'_>) + Send + Sync + 'static,
    {
        self.monitors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(monitor));
        debug!("Monitor subscribed on channel '{}'", self.name);
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Units still tracked (running, or finished but not yet reclaimed).
    pub fn pending(&self) -> usize {
        lock(&self.units).len()
    }

    /// Runs `work` on a new worker thread as a background unit of this channel.
    ///
    /// A returned error or a panic faults the unit. The failure stays with
    /// the unit until someone joins it or a finalization pass escalates it.
    pub fn spawn<F>(&self, name: &str, work: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(UnitCell::new(id, name));
        lock(&self.units).push(Arc::clone(&cell));
        let task = Task::new(Arc::clone(&cell));

        let monitors = Arc::clone(&self.monitors);
        let snapshot = move || monitors.read().unwrap_or_else(PoisonError::into_inner).len();
        let worker_cell = Arc::clone(&cell);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-unit-{id}", self.name))
            .spawn(move || {
                worker_cell.mark_running();
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(work));
                match outcome {
                    Ok(Ok(())) => worker_cell.complete(),
                    Ok(Err(e)) => worker_cell.fault(Failure::from_error(&e), snapshot()),
                    Err(payload) => worker_cell.fault(Failure::from_panic(payload), snapshot()),
                }
            });

        if let Err(e) = spawned {
            warn!("Channel '{}': could not start unit {id}: {e}", self.name);
            let count = self.monitor_count();
            cell.fault(Failure::new(format!("failed to start worker thread: {e}")), count);
        } else {
            debug!("Channel '{}': spawned unit {id} ({name})", self.name);
        }
        task
    }

    /// Finalization pass over this channel.
    ///
    /// Reclaims every finished, unreferenced unit. Faulted ones that were
    /// never observed are escalated exactly once. Monitors run outside the
    /// registry lock.
    pub fn reap(&self) -> Result<ReapReport, UnobservedAsyncFailure> {
        let reclaimed: Vec<Arc<UnitCell>> = {
            let mut units = lock(&self.units);
            let (dead, live): (Vec<_>, Vec<_>) =
                units.drain(..).partition(|unit| unit.is_reclaimable());
            *units = live;
            dead
        };

        let mut report = ReapReport {
            reclaimed: reclaimed.len(),
            ..ReapReport::default()
        };
        if reclaimed.is_empty() {
            return Ok(report);
        }

        let monitors: Vec<MonitorFn> = self
            .monitors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut fatal = Vec::new();

        for unit in &reclaimed {
            let Some((failure, monitors_at_fault)) = unit.captured_fault() else {
                continue;
            };
            if unit.is_observed() {
                continue;
            }

            let event = EscalationEvent {
                channel: &self.name,
                unit_id: unit.id(),
                unit_name: unit.name(),
                failure: &failure,
                observed: unit.observed_flag(),
            };
            report.escalated += 1;
            for monitor in monitors.iter().take(monitors_at_fault) {
                monitor(&event);
            }

            if event.is_observed() {
                report.observed += 1;
            } else {
                fatal.push(failure);
            }
        }

        debug!(
            "Channel '{}': reclaimed {}, escalated {}, observed {}",
            self.name, report.reclaimed, report.escalated, report.observed
        );

        if fatal.is_empty() {
            Ok(report)
        } else {
            Err(UnobservedAsyncFailure {
                channel: self.name.clone(),
                failures: fatal,
            })
        }
    }
}

impl Drop for EscalationChannel {
    fn drop(&mut self) {
        let units = lock(&self.units);
        let lost = units
            .iter()
            .filter(|u| u.captured_fault().is_some() && !u.is_observed())
            .count();
        if lost > 0 {
            warn!(
                "Channel '{}' dropped with {lost} faulted unit(s) never reaped",
                self.name
            );
        }
    }
}

/// Creates channels and runs finalization passes over all of them.
///
/// Channels are tracked weakly: dropping the last owner (e.g. an unloaded
/// domain) removes the channel from later passes.
#[derive(Default)]
pub struct Finalizer {
    channels: Mutex<Vec<Weak<EscalationChannel>>>,
}

impl Finalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, name: &str) -> Arc<EscalationChannel> {
        let channel = EscalationChannel::new(name);
        lock(&self.channels).push(Arc::downgrade(&channel));
        channel
    }

    /// Number of channels still alive.
    pub fn live_channels(&self) -> usize {
        let mut channels = lock(&self.channels);
        channels.retain(|c| c.strong_count() > 0);
        channels.len()
    }

    /// Reaps every live channel, in creation order.
    ///
    /// The pass always visits all channels; the first channel that revealed
    /// an unobserved failure is reported.
    pub fn collect(&self) -> Result<ReapReport, UnobservedAsyncFailure> {
        let live: Vec<Arc<EscalationChannel>> = {
            let mut channels = lock(&self.channels);
            channels.retain(|c| c.strong_count() > 0);
            channels.iter().filter_map(Weak::upgrade).collect()
        };

        let mut total = ReapReport::default();
        let mut first_fatal = None;
        for channel in live {
            match channel.reap() {
                Ok(report) => total += report,
                Err(unobserved) => {
                    first_fatal.get_or_insert(unobserved);
                }
            }
        }

        match first_fatal {
            Some(unobserved) => Err(unobserved),
            None => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::unit::UnitState;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_monitor(channel: &EscalationChannel) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        channel.subscribe(move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            event.set_observed();
        });
        seen
    }

    fn fault_and_forget(channel: &EscalationChannel, message: &'static str) {
        let task = channel.spawn("faulty", move || anyhow::bail!(message));
        task.completion().wait();
    }

    #[test]
    fn test_monitored_fault_is_observed() {
        let channel = EscalationChannel::new("Sandbox");
        let seen = counting_monitor(&channel);

        fault_and_forget(&channel, "oops");
        let report = channel.reap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            report,
            ReapReport {
                reclaimed: 1,
                escalated: 1,
                observed: 1
            }
        );
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_unmonitored_fault_is_fatal() {
        let channel = EscalationChannel::new("host");
        fault_and_forget(&channel, "serious error.");

        let err = channel.reap().unwrap_err();
        assert_eq!(err.channel, "host");
        assert_eq!(err.failures, vec![Failure::new("serious error.")]);
        assert_eq!(
            err.to_string(),
            "1 unobserved background failure(s) on channel 'host': serious error."
        );
    }

    #[test]
    fn test_monitor_installed_after_fault_does_not_observe() {
        let channel = EscalationChannel::new("late");
        fault_and_forget(&channel, "too early");
        let seen = counting_monitor(&channel);

        assert!(channel.reap().is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_escalation_fires_at_most_once() {
        let channel = EscalationChannel::new("Sandbox");
        let seen = counting_monitor(&channel);

        fault_and_forget(&channel, "oops");
        channel.reap().unwrap();
        let second = channel.reap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(second, ReapReport::default());
    }

    #[test]
    fn test_referenced_unit_is_not_reclaimed() {
        let channel = EscalationChannel::new("Sandbox");
        let seen = counting_monitor(&channel);

        let task = channel.spawn("held", || anyhow::bail!("oops"));
        let handle = task.completion();
        handle.wait();
        drop(task);

        assert_eq!(channel.reap().unwrap().reclaimed, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        drop(handle);
        assert_eq!(channel.reap().unwrap().escalated, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_joined_fault_is_not_escalated() {
        let channel = EscalationChannel::new("host");
        let task = channel.spawn("joined", || anyhow::bail!("handled"));
        assert_eq!(task.join().unwrap_err().message, "handled");

        let report = channel.reap().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.escalated, 0);
    }

    #[test]
    fn test_completed_unit_reclaimed_silently() {
        let channel = EscalationChannel::new("host");
        let task = channel.spawn("fine", || Ok(()));
        task.completion().wait();
        assert_eq!(task.state(), UnitState::Completed);
        drop(task);

        let report = channel.reap().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.escalated, 0);
    }

    #[test]
    fn test_panicking_unit_faults() {
        let channel = EscalationChannel::new("host");
        let task = channel.spawn("panics", || panic!("kaboom"));
        assert_eq!(task.join().unwrap_err().message, "kaboom");
    }

    #[test]
    fn test_monitor_sees_only_its_own_channel() {
        let sandbox = EscalationChannel::new("Sandbox");
        let host = EscalationChannel::new("host");
        let seen = counting_monitor(&sandbox);

        fault_and_forget(&host, "host fault");
        assert!(sandbox.reap().is_ok());
        assert!(host.reap().is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_faults_get_distinct_events() {
        let channel = EscalationChannel::new("Sandbox");
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        channel.subscribe(move |event| {
            lock(&sink).push(event.unit_id());
            event.set_observed();
        });

        let tasks: Vec<Task> = (0..8)
            .map(|i| channel.spawn("burst", move || anyhow::bail!("fault {i}")))
            .collect();
        for task in &tasks {
            task.completion().wait();
        }
        drop(tasks);

        let report = channel.reap().unwrap();
        assert_eq!(report.escalated, 8);
        assert_eq!(report.observed, 8);

        let mut ids = lock(&ids).clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_concurrent_reaps_deliver_each_unit_once() {
        let channel = EscalationChannel::new("Sandbox");
        let seen = counting_monitor(&channel);
        for i in 0..16 {
            let task = channel.spawn("burst", move || anyhow::bail!("fault {i}"));
            task.completion().wait();
        }

        let reports: Vec<ReapReport> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4).map(|_| scope.spawn(|| channel.reap().unwrap())).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut total = ReapReport::default();
        for report in reports {
            total += report;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 16);
        assert_eq!(total.escalated, 16);
        assert_eq!(total.observed, 16);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_observed_never_reverts() {
        let channel = EscalationChannel::new("Sandbox");
        channel.subscribe(|event| event.set_observed());
        channel.subscribe(|event| {
            assert!(event.is_observed());
        });

        fault_and_forget(&channel, "oops");
        assert_eq!(channel.reap().unwrap().observed, 1);
    }

    #[test]
    fn test_finalizer_collects_all_channels() {
        let finalizer = Finalizer::new();
        let sandbox = finalizer.channel("Sandbox");
        let host = finalizer.channel("host");
        let seen = counting_monitor(&sandbox);

        fault_and_forget(&sandbox, "oops");
        fault_and_forget(&host, "serious error.");

        let err = finalizer.collect().unwrap_err();
        assert_eq!(err.channel, "host");
        // The sandbox fault was still delivered during the same pass.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.pending(), 0);
    }

    #[test]
    fn test_finalizer_forgets_dropped_channels() {
        let finalizer = Finalizer::new();
        let kept = finalizer.channel("kept");
        let dropped = finalizer.channel("dropped");
        assert_eq!(finalizer.live_channels(), 2);

        drop(dropped);
        assert_eq!(finalizer.live_channels(), 1);
        assert_eq!(finalizer.collect().unwrap(), ReapReport::default());
        drop(kept);
    }
}
