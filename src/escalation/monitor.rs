//! Failure logging and the async failure monitor.
//!
//! Both the monitor and the host's synchronous error path write through
//! the same [`FailureLog`], so a recovered failure looks identical on the
//! console whichever way it was caught:
//!
//! ```text
//! ****
//! oops
//! ****
//! ```

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{EscalationChannel, EscalationEvent, Failure};

/// Host-visible output channel for failure blocks.
///
/// Writes never fail from the caller's point of view: I/O errors and
/// poisoned locks are swallowed.
pub struct FailureLog {
    out: Mutex<Box<dyn Write + Send>>,
}

impl FailureLog {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Writes one block per call. Equal failures are not merged.
    pub fn log(&self, failure: &Failure) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = write!(out, "****\n{}\n****\n", failure.message);
        let _ = out.flush();
        if let Some(trace) = &failure.trace {
            debug!("Failure trace: {trace}");
        }
    }
}

/// Logs escalated background failures and marks them observed.
#[derive(Clone)]
pub struct AsyncFailureMonitor {
    log: Arc<FailureLog>,
}

impl AsyncFailureMonitor {
    pub fn new(log: Arc<FailureLog>) -> Self {
        Self { log }
    }

    pub fn handle(&self, event: &EscalationEvent<'_>) {
        warn!(
            "Unobserved failure in unit {} ({}) on channel '{}'",
            event.unit_id(),
            event.unit_name(),
            event.channel()
        );
        self.log.log(event.failure());
        event.set_observed();
    }

    /// Subscribes this monitor on `channel`.
    pub fn install(self, channel: &EscalationChannel) {
        channel.subscribe(move |event| self.handle(event));
    }
}

/// In-memory writer shared between a `FailureLog` and a test.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
