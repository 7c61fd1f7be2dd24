//! Execution serializer: a strict, hot-reload-aware FIFO for tool calls.
//!
//! Concurrent submissions from any ingress path (stdio, relayed websocket
//! connections) land in one ordered queue owned by the [`Serializer`]
//! instance; at most one handler body runs at a time, in exact submission
//! order. The first entry of each batch (a maximal contiguous run with no
//! empty-queue gap) triggers a staleness check against the injected change
//! detector; a rebuilt server schedules a restart that drains the queue and
//! shuts the process down through the injected hooks.
//!
//! Handler timeouts are the handlers' own concern: they start only when the
//! handler future is first polled, so queue wait and check time never count
//! against them.

mod restart;

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use webmux_protocol::ToolResult;

pub use restart::{RestartController, RestartState, ShutdownHooks};

use crate::error::Result;

/// Fixed result for calls that arrive (or are still queued) once a restart is
/// scheduled.
pub const RESTARTING_MESSAGE: &str =
    "The server is restarting to pick up code changes. Please retry this call in a few seconds.";

/// Result for the call whose staleness check discovered the rebuild.
pub const RESTART_PENDING_MESSAGE: &str =
    "Server code changed and was rebuilt; the server will restart now. Please retry this call in a few seconds.";

/// Informational prefix when the companion was rebuilt but no restart is
/// needed on this side.
pub const COMPANION_REBUILT_BANNER: &str =
    "Note: the browser companion was rebuilt. Reload it to pick up the changes.\n\n";

const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Boxed handler body for one tool call.
pub type ExecFuture = Pin<Box<dyn Future<Output = Result<ToolResult>> + Send>>;

/// What the change detector reports for one check.
#[derive(Debug, Clone, Default)]
pub struct ChangeCheckResult {
    pub own_source_changed: bool,
    pub own_rebuilt: bool,
    pub own_build_error: Option<String>,
    pub companion_changed: bool,
    pub companion_rebuilt: bool,
    pub companion_build_error: Option<String>,
    pub reconnect_port: Option<u16>,
    pub reconnect_timestamp: Option<u64>,
}

/// Collaborator that detects source changes and rebuilds since the last check.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    async fn check(&self, server_root: &Path, companion_root: &Path) -> Result<ChangeCheckResult>;
}

/// Side channel bracketed around each change-detector round trip.
///
/// Both calls are best-effort: failures are logged and never interrupt the
/// batch check.
#[async_trait]
pub trait SideChannel: Send + Sync {
    /// Called before the detector runs.
    async fn suspend(&self) -> Result<()>;

    /// Called after the detector (or its substituted all-false result),
    /// receiving the outcome so the side channel can reconcile its state.
    async fn reconcile(&self, outcome: &ChangeCheckResult) -> Result<()>;
}

/// Staleness-checking collaborators and the roots they watch.
pub struct StalenessConfig {
    pub server_root: PathBuf,
    pub companion_root: PathBuf,
    pub detector: Arc<dyn ChangeDetector>,
    pub side_channel: Arc<dyn SideChannel>,
}

struct PendingCall {
    name: String,
    exec: ExecFuture,
    resolve: oneshot::Sender<ToolResult>,
}

impl PendingCall {
    fn resolve(self, result: ToolResult) {
        // The submitter may have gone away; a dropped receiver is fine.
        let _ = self.resolve.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<PendingCall>,
    processing: bool,
    batch_checked: bool,
}

enum CheckOutcome {
    /// The entry was resolved by the check itself.
    Handled,
    /// Proceed to execute, optionally prefixing the banner on success.
    Execute {
        entry: PendingCall,
        banner: Option<&'static str>,
    },
}

/// The serializer instance. Shared behind an [`Arc`]; all ingress paths of a
/// process submit to the same instance.
pub struct Serializer {
    state: Mutex<QueueState>,
    staleness: Option<StalenessConfig>,
    hooks: Arc<dyn ShutdownHooks>,
    restart: RestartController,
    flush_delay: Duration,
}

impl Serializer {
    pub fn new(staleness: Option<StalenessConfig>, hooks: Arc<dyn ShutdownHooks>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            staleness,
            hooks,
            restart: RestartController::default(),
            flush_delay: DEFAULT_FLUSH_DELAY,
        }
    }

    /// Overrides the post-drain flush delay (tests use a short one).
    pub fn with_flush_delay(mut self, flush_delay: Duration) -> Self {
        self.flush_delay = flush_delay;
        self
    }

    /// Submits a tool call and waits for its result.
    ///
    /// Calls are resolved strictly in submission order; a scheduled restart
    /// short-circuits with the fixed restarting message instead of enqueuing.
    pub async fn submit(self: &Arc<Self>, name: impl Into<String>, exec: ExecFuture) -> ToolResult {
        if self.restart.is_scheduled() {
            return ToolResult::text(RESTARTING_MESSAGE);
        }

        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let start_loop = {
            let mut state = self.state.lock();
            state.queue.push_back(PendingCall {
                name,
                exec,
                resolve: tx,
            });
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if start_loop {
            let this = Arc::clone(self);
            tokio::spawn(this.run_loop());
        }

        rx.await
            .unwrap_or_else(|_| ToolResult::error("tool call was dropped before completion"))
    }

    /// Convenience wrapper boxing a plain future.
    pub async fn submit_fn<F>(self: &Arc<Self>, name: impl Into<String>, exec: F) -> ToolResult
    where
        F: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        self.submit(name, Box::pin(exec)).await
    }

    /// Schedules a restart: idempotent, drains the queue with the restarting
    /// message, then flushes and runs the 3-step shutdown in the background.
    pub fn schedule_restart(self: &Arc<Self>, reason: &str) {
        if !self.restart.begin() {
            return;
        }
        info!(target = "webmux.serializer", reason, "restart scheduled, draining queue");
        self.drain_queue();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.restart
                .flush_and_terminate(this.hooks.as_ref(), this.flush_delay)
                .await;
        });
    }

    pub fn restart_state(&self) -> RestartState {
        self.restart.state()
    }

    /// True while the processing loop is running.
    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.restart.is_scheduled() {
                self.drain_queue();
                self.state.lock().processing = false;
                return;
            }

            let entry = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(entry) => Some(entry),
                    None => {
                        // Queue fully drained: the batch ends here. The next
                        // submission starts a new batch and re-checks.
                        state.processing = false;
                        state.batch_checked = false;
                        None
                    }
                }
            };
            let Some(entry) = entry else { return };

            let needs_check = self.staleness.is_some() && !self.state.lock().batch_checked;
            let (entry, banner) = if needs_check {
                match self.run_batch_check(entry).await {
                    CheckOutcome::Handled => continue,
                    CheckOutcome::Execute { entry, banner } => (entry, banner),
                }
            } else {
                (entry, None)
            };

            debug!(target = "webmux.serializer", name = %entry.name, "executing tool call");
            let exec = entry.exec;
            let resolver = entry.resolve;
            let result = match exec.await {
                Ok(result) => match banner {
                    Some(banner) => result.with_banner(banner),
                    None => result,
                },
                // One entry's failure must never stop the loop.
                Err(err) => ToolResult::error(err.to_string()),
            };
            let _ = resolver.send(result);
        }
    }

    /// Runs the once-per-batch staleness check for `entry`.
    async fn run_batch_check(self: &Arc<Self>, entry: PendingCall) -> CheckOutcome {
        let Some(staleness) = &self.staleness else {
            return CheckOutcome::Execute { entry, banner: None };
        };

        if let Err(err) = staleness.side_channel.suspend().await {
            debug!(target = "webmux.serializer", error = %err, "side channel suspend failed");
        }

        let outcome = match staleness
            .detector
            .check(&staleness.server_root, &staleness.companion_root)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target = "webmux.serializer", error = %err, "change detector failed, assuming no changes");
                ChangeCheckResult::default()
            }
        };

        if let Err(err) = staleness.side_channel.reconcile(&outcome).await {
            warn!(target = "webmux.serializer", error = %err, "side channel reconcile failed");
        }

        // First match wins. Build failures are reported to this one caller
        // and deliberately leave the batch unchecked so the next entry runs
        // the check again.
        if let Some(log) = outcome.companion_build_error {
            entry.resolve(ToolResult::error(format!(
                "The browser companion failed to rebuild:\n{log}"
            )));
            return CheckOutcome::Handled;
        }
        if let Some(log) = outcome.own_build_error {
            entry.resolve(ToolResult::error(format!(
                "The server failed to rebuild:\n{log}"
            )));
            return CheckOutcome::Handled;
        }
        if outcome.own_rebuilt {
            entry.resolve(ToolResult::text(RESTART_PENDING_MESSAGE));
            self.schedule_restart("server source rebuilt");
            return CheckOutcome::Handled;
        }

        self.state.lock().batch_checked = true;
        let banner = outcome.companion_rebuilt.then_some(COMPANION_REBUILT_BANNER);
        CheckOutcome::Execute { entry, banner }
    }

    fn drain_queue(&self) {
        let drained: Vec<PendingCall> = {
            let mut state = self.state.lock();
            state.queue.drain(..).collect()
        };
        for entry in drained {
            entry.resolve(ToolResult::text(RESTARTING_MESSAGE));
        }
    }
}
