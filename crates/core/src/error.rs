//! Error types for the webmux core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the webmux core.
#[derive(Debug, Error)]
pub enum Error {
    /// No reachable Primary after exhausting all recovery attempts.
    ///
    /// Fatal for a Secondary: it cannot make forward progress and must not
    /// silently hang, so the process exits non-zero on this error.
    #[error("no reachable Primary after {attempts} recovery attempts")]
    PrimaryUnreachable { attempts: u32 },

    /// The Primary endpoint answered, but not with a healthy payload.
    #[error("Primary endpoint on port {port} is unreachable: {reason}")]
    ProbeFailed { port: u16, reason: String },

    /// Failed to write or clear the lock record.
    #[error("lock registry error at {path}: {source}")]
    LockRegistry {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Websocket connection to the Primary failed.
    #[error("Primary connection error: {0}")]
    PrimaryConnection(String),

    /// A handler or collaborator reported a failure.
    #[error("tool handler error: {0}")]
    Handler(String),

    /// Malformed protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on an ingress or egress channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal channel closed unexpectedly.
    #[error("channel closed unexpectedly")]
    ChannelClosed,
}
