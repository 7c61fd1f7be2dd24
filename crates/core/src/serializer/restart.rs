//! Restart/shutdown state machine for the execution serializer.
//!
//! Scheduling a restart moves through `Idle -> Draining -> Flushing ->
//! Terminated`. Draining resolves every queued entry with the restarting
//! message, Flushing waits a short fixed delay so responses reach their
//! clients, and termination runs a 3-step shutdown where every step is
//! attempted regardless of prior failures.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::Result;

/// Process-lifecycle collaborators injected into the serializer.
#[async_trait]
pub trait ShutdownHooks: Send + Sync {
    /// Informs the companion process that this process may be terminated.
    async fn notify_companion(&self) -> Result<()>;

    /// Releases additional process resources (sessions, sockets, locks).
    async fn release_resources(&self) -> Result<()>;

    /// Terminates the process. The production implementation calls
    /// `std::process::exit`; tests record the code instead.
    fn terminate(&self, code: i32);
}

/// Phase of a scheduled restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Draining,
    Flushing,
    Terminated,
}

/// Owns the restart phase and runs the shutdown sequence.
#[derive(Debug)]
pub struct RestartController {
    state: Mutex<RestartState>,
}

impl Default for RestartController {
    fn default() -> Self {
        Self {
            state: Mutex::new(RestartState::Idle),
        }
    }
}

impl RestartController {
    pub fn state(&self) -> RestartState {
        *self.state.lock()
    }

    /// True once a restart has been scheduled; new submissions must not
    /// enqueue past this point.
    pub fn is_scheduled(&self) -> bool {
        self.state() != RestartState::Idle
    }

    /// Attempts the `Idle -> Draining` transition. Returns false when a
    /// restart is already in flight, making scheduling idempotent.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state != RestartState::Idle {
            return false;
        }
        *state = RestartState::Draining;
        true
    }

    /// Runs `Flushing -> Terminated`: flush delay, then the 3-step shutdown.
    pub(crate) async fn flush_and_terminate(&self, hooks: &dyn ShutdownHooks, flush_delay: Duration) {
        *self.state.lock() = RestartState::Flushing;
        tokio::time::sleep(flush_delay).await;

        if let Err(err) = hooks.notify_companion().await {
            warn!(target = "webmux.serializer", error = %err, "companion termination notice failed");
        }
        if let Err(err) = hooks.release_resources().await {
            warn!(target = "webmux.serializer", error = %err, "resource release failed");
        }

        *self.state.lock() = RestartState::Terminated;
        info!(target = "webmux.serializer", "restart shutdown complete, terminating");
        hooks.terminate(0);
    }
}
