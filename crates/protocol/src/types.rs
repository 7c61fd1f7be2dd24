//! Tool-call, control, and DevTools envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool call as submitted by an agent client.
///
/// Sent as a single newline-delimited JSON object over the ingress channel
/// (stdio, or a relayed websocket frame on the Primary's `/rpc` endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Client-chosen id echoed back in the response.
    pub id: u64,
    /// Tool name, e.g. `"navigate"`.
    pub name: String,
    /// Tool arguments, opaque to the transport layers.
    #[serde(default)]
    pub arguments: Value,
}

/// Response to a [`ToolCallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    /// Id of the request this answers.
    pub id: u64,
    /// Outcome of the call.
    pub result: ToolResult,
}

/// Outcome of a tool call.
///
/// Errors are carried in-band (`isError: true`) rather than as a transport
/// failure: a failing handler still produces a well-formed response for the
/// one caller that submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Human/agent-readable result text.
    pub content: String,
    /// Whether this result represents a failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result with the given text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Error-flagged result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }

    /// Returns a copy of this result with `banner` prepended to the content.
    pub fn with_banner(self, banner: &str) -> Self {
        Self {
            content: format!("{banner}{}", self.content),
            is_error: self.is_error,
        }
    }
}

/// Payload served by the Primary's `GET /health` route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` when the Primary is serving.
    pub status: String,
    /// Instance id of the serving process, used to detect stale lock records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl HealthResponse {
    pub fn ok(instance_id: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            instance_id: Some(instance_id.into()),
        }
    }
}

/// Persisted record identifying the current Primary process.
///
/// Single writer (the Primary), many readers, last-write-wins. Readers must
/// tolerate a missing or stale file and re-read rather than cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Pid of the Primary.
    pub pid: u32,
    /// Port its RPC endpoint is bound to.
    pub port: u16,
    /// Random id minted at startup; distinguishes a restarted Primary reusing
    /// the same port from the one that wrote the record.
    pub instance_id: String,
    /// Milliseconds since the unix epoch at write time.
    pub timestamp_ms: u64,
}

/// A DevTools-protocol command as issued by the embedded browser-control
/// library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpCommand {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Description of one debuggable target, in DevTools `TargetInfo` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub target_id: String,
    /// Target kind, `"page"` for content targets.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

impl TargetDescriptor {
    /// A content (page) target.
    pub fn page(target_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            kind: "page".to_string(),
            title: title.into(),
            url: url.into(),
            attached: false,
        }
    }
}
