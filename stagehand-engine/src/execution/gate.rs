// Manual gate
// Holds manual jobs until they are played; shared between the executor and its caller

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Result of waiting on a manual job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Played,
    /// The gate was closed before the job was played
    Closed,
    Cancelled,
}

#[derive(Debug, Default)]
struct GateState {
    advanced: HashSet<String>,
    closed: bool,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    notify: Notify,
}

/// Cloneable handle for playing manual jobs
///
/// A job is played when either its instance name (`image: [arm64]`) or its
/// logical name (`image`) has been advanced.
#[derive(Debug, Clone, Default)]
pub struct ManualGate {
    inner: Arc<GateInner>,
}

impl ManualGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play a manual job, before or during a run
    pub fn advance(&self, job: impl Into<String>) {
        let job = job.into();
        tracing::info!(job = %job, "manual job advanced");
        self.state().advanced.insert(job);
        self.inner.notify.notify_waiters();
    }

    /// Stop accepting plays; pending waits resolve as `Closed`
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn is_advanced(&self, instance: &str, job: &str) -> bool {
        let state = self.state();
        state.advanced.contains(instance) || state.advanced.contains(job)
    }

    /// Wait until the job is played, the gate closes or the run is cancelled
    pub async fn wait(&self, instance: &str, job: &str, cancel: &CancellationToken) -> GateDecision {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an advance in between is not lost
            notified.as_mut().enable();

            {
                let state = self.state();
                if state.advanced.contains(instance) || state.advanced.contains(job) {
                    return GateDecision::Played;
                }
                if state.closed {
                    return GateDecision::Closed;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return GateDecision::Cancelled,
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
