//! Liveness probe against a recorded Primary endpoint.

use std::time::Duration;

use tracing::debug;
use webmux_protocol::{HealthResponse, LockRecord};

use crate::error::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Path served by the Primary for reachability + identity checks.
pub const HEALTH_PATH: &str = "/health";
/// Path for the graceful remote session-termination call.
pub const SESSION_CLOSE_PATH: &str = "/session/close";
/// Path carrying the relayed tool-call protocol.
pub const RPC_PATH: &str = "/rpc";

/// HTTP client for the Primary's control routes.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    http: reqwest::Client,
}

impl Default for ProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeClient {
    pub fn new() -> Self {
        // Builder only fails on TLS misconfiguration; with rustls baked in it
        // cannot, so fall back to the default client rather than propagating.
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Probes `http://127.0.0.1:{port}/health`.
    ///
    /// Any non-200 status or transport error means unreachable.
    pub async fn probe(&self, port: u16) -> Result<HealthResponse> {
        let url = format!("http://127.0.0.1:{port}{HEALTH_PATH}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::ProbeFailed {
                port,
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::ProbeFailed {
                port,
                reason: format!("unexpected status {}", response.status()),
            });
        }

        response.json().await.map_err(|err| Error::ProbeFailed {
            port,
            reason: format!("invalid health payload: {err}"),
        })
    }

    /// Checks that the endpoint named by `record` is alive and is still the
    /// same process that wrote the record.
    ///
    /// A health payload without an instance id cannot be identity-checked, so
    /// reachability alone is trusted. A mismatched id means the record is
    /// stale (a different process now owns the port).
    pub async fn verify(&self, record: &LockRecord) -> bool {
        match self.probe(record.port).await {
            Ok(health) => match health.instance_id {
                Some(id) if id != record.instance_id => {
                    debug!(
                        target = "webmux.probe",
                        port = record.port,
                        recorded = %record.instance_id,
                        found = %id,
                        "lock record is stale"
                    );
                    false
                }
                _ => true,
            },
            Err(err) => {
                debug!(target = "webmux.probe", port = record.port, error = %err, "probe failed");
                false
            }
        }
    }

    /// Asks the Primary to end this client's session. Best-effort: failures
    /// are reported to the caller only so it can log them.
    pub async fn request_session_close(&self, port: u16) -> Result<()> {
        let url = format!("http://127.0.0.1:{port}{SESSION_CLOSE_PATH}");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|err| Error::ProbeFailed {
                port,
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::ProbeFailed {
                port,
                reason: format!("session close returned {}", response.status()),
            });
        }
        Ok(())
    }
}
