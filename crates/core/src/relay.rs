//! Relay connection seam.
//!
//! The relay is the external channel through which DevTools-protocol traffic
//! reaches the browser, mediated by a companion process. The adapter does not
//! own it; it only sends commands and subscribes to its events.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Events emitted by a relay connection.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A command the relay forwarded to the browser succeeded.
    Result { id: u64, value: Value },
    /// A forwarded command failed.
    Error { id: u64, message: String },
    /// A protocol event from the browser side.
    Protocol {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
    /// The relay channel dropped.
    Disconnected,
    /// The browser side detached the control link.
    Detached { reason: String },
}

/// The relayed single-target control link to the browser.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Fire-and-forget command; the outcome arrives later as
    /// [`RelayEvent::Result`] or [`RelayEvent::Error`] carrying `id`.
    fn send_message(&self, id: u64, method: &str, params: Value, session_id: Option<&str>);

    /// Round-trip request for callers that want the result inline.
    async fn send_request(&self, method: &str, params: Value) -> Result<Value>;

    /// Subscribes to the relay's event stream.
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;
}
