//! Background work units and their handles.
//!
//! A unit runs on its own OS thread. Callers get a [`Task`] (the
//! higher-level result object) and can derive a [`CompletionHandle`]
//! from it (the raw "finished" signal). Only `Task::join` retrieves the
//! failure and marks it observed; waiting on the completion handle does
//! not.
//!
//! Reachability is tracked by counting live handles ("roots"). The
//! worker thread's own reference is not a root, so a unit becomes
//! reclaimable the moment its last handle is dropped after it finished.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a background work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Faulted,
    Completed,
}

impl UnitState {
    pub fn is_finished(self) -> bool {
        matches!(self, UnitState::Faulted | UnitState::Completed)
    }
}

/// A captured failure: what gets logged and escalated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub trace: Option<String>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// Message is the outermost context; the full chain becomes the trace.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let trace = (err.chain().count() > 1).then(|| format!("{err:?}"));
        Self {
            message: err.to_string(),
            trace,
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "background work panicked".to_string()
        };
        Self::new(message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

struct UnitInner {
    state: UnitState,
    failure: Option<Failure>,
    /// Monitors subscribed on the owning channel when the fault happened
    monitors_at_fault: usize,
}

/// Shared state of one unit. Held by the channel registry, the worker
/// thread and every handle.
pub(crate) struct UnitCell {
    id: u64,
    name: String,
    inner: Mutex<UnitInner>,
    finished: Condvar,
    observed: AtomicBool,
    roots: AtomicUsize,
}

impl UnitCell {
    pub(crate) fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            inner: Mutex::new(UnitInner {
                state: UnitState::Pending,
                failure: None,
                monitors_at_fault: 0,
            }),
            finished: Condvar::new(),
            observed: AtomicBool::new(false),
            roots: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> UnitState {
        self.lock().state
    }

    pub(crate) fn mark_running(&self) {
        self.lock().state = UnitState::Running;
    }

    pub(crate) fn complete(&self) {
        self.lock().state = UnitState::Completed;
        self.finished.notify_all();
    }

    pub(crate) fn fault(&self, failure: Failure, monitors_at_fault: usize) {
        {
            let mut inner = self.lock();
            inner.state = UnitState::Faulted;
            inner.failure = Some(failure);
            inner.monitors_at_fault = monitors_at_fault;
        }
        self.finished.notify_all();
    }

    fn wait(&self) {
        let mut inner = self.lock();
        while !inner.state.is_finished() {
            inner = self
                .finished
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Failure and monitor snapshot, if the unit faulted.
    pub(crate) fn captured_fault(&self) -> Option<(Failure, usize)> {
        let inner = self.lock();
        inner
            .failure
            .clone()
            .map(|failure| (failure, inner.monitors_at_fault))
    }

    pub(crate) fn observed_flag(&self) -> &AtomicBool {
        &self.observed
    }

    pub(crate) fn is_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// Finished and no handle left anywhere.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.roots.load(Ordering::Acquire) == 0 && self.state().is_finished()
    }
}

/// A counted reference that keeps a unit reachable.
struct Root(Arc<UnitCell>);

impl Root {
    fn new(cell: Arc<UnitCell>) -> Self {
        cell.roots.fetch_add(1, Ordering::AcqRel);
        Self(cell)
    }
}

impl Clone for Root {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.0))
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        self.0.roots.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Result object of a background unit.
#[derive(Clone)]
pub struct Task {
    root: Root,
}

impl Task {
    pub(crate) fn new(cell: Arc<UnitCell>) -> Self {
        Self {
            root: Root::new(cell),
        }
    }

    pub fn id(&self) -> u64 {
        self.root.0.id()
    }

    pub fn state(&self) -> UnitState {
        self.root.0.state()
    }

    pub fn is_observed(&self) -> bool {
        self.root.0.is_observed()
    }

    /// Raw completion primitive for this unit.
    pub fn completion(&self) -> CompletionHandle {
        CompletionHandle {
            root: self.root.clone(),
        }
    }

    /// Waits for the unit and retrieves its failure, marking it observed.
    pub fn join(self) -> Result<(), Failure> {
        let cell = &self.root.0;
        cell.wait();
        match cell.captured_fault() {
            Some((failure, _)) => {
                cell.observed.store(true, Ordering::Release);
                Err(failure)
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.root.0.name())
            .field("state", &self.state())
            .field("observed", &self.is_observed())
            .finish()
    }
}

/// Signals "finished" without exposing the outcome.
#[derive(Clone)]
pub struct CompletionHandle {
    root: Root,
}

impl CompletionHandle {
    /// Blocks until the unit is Completed or Faulted. Never observes the failure.
    pub fn wait(&self) {
        self.root.0.wait();
    }

    pub fn is_finished(&self) -> bool {
        self.root.0.state().is_finished()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.root.0.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}
