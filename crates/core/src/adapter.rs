//! Session-multiplexing transport adapter.
//!
//! The embedded browser-control library expects a native multi-target
//! DevTools endpoint: it discovers targets, attaches to them, and issues
//! commands per session. The only real channel is one relayed, single-target
//! control link, so this adapter fakes the multi-target surface: discovery
//! and attach-family commands are answered locally from synthetic state, and
//! everything else is forwarded over the relay.
//!
//! The adapter is the sole authority for attach/detach lifecycle. It emits
//! its own ordered startup events and suppresses the relay's attachment
//! events so the library never sees two conflicting narrators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webmux_protocol::{CdpCommand, TargetDescriptor};

use crate::error::{Error, Result};
use crate::relay::{RelayConnection, RelayEvent};

/// Target id of the fixed synthetic browser pseudo-target.
pub const BROWSER_TARGET_ID: &str = "webmux-browser";

/// Derives the synthetic session id for a target. Deterministic, so a
/// re-attach to the same target always yields the same session.
fn derive_session_id(target_id: &str) -> String {
    format!("session-{target_id}")
}

fn browser_descriptor() -> TargetDescriptor {
    TargetDescriptor {
        target_id: BROWSER_TARGET_ID.to_string(),
        kind: "browser".to_string(),
        title: String::new(),
        url: String::new(),
        attached: true,
    }
}

enum LocalReply {
    Result(Value),
    Error(String),
}

/// Adapter between the browser-control library and one relay connection.
///
/// Two-phase startup: [`SessionAdapter::new`] wires the state and hands back
/// the upward event stream, [`SessionAdapter::start`] subscribes to the relay
/// and emits the synthetic startup events. Splitting the phases guarantees
/// the library's listeners are attached before any event fires.
pub struct SessionAdapter {
    relay: Arc<dyn RelayConnection>,
    content: Option<TargetDescriptor>,
    /// targetId -> sessionId; lazily populated, entries never removed while
    /// the adapter lives.
    sessions: Mutex<HashMap<String, String>>,
    upward: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionAdapter {
    /// Creates the adapter and returns the upward message stream (responses
    /// and events toward the browser-control library). The stream ends when
    /// the transport closes.
    pub fn new(
        relay: Arc<dyn RelayConnection>,
        content: Option<TargetDescriptor>,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            relay,
            content,
            sessions: Mutex::new(HashMap::new()),
            upward: Mutex::new(Some(tx)),
            pump: Mutex::new(None),
        };
        (adapter, rx)
    }

    /// Subscribes to the relay and starts the event pump. The synthetic
    /// startup events are emitted from the pump task, so they land after the
    /// caller has wired its listeners but before any forwarded relay event.
    pub fn start(self: &Arc<Self>) {
        let events = self.relay.subscribe();
        let Some(upward) = self.upward.lock().clone() else {
            return;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(this.pump_events(events, upward));
        *self.pump.lock() = Some(handle);
    }

    /// Handles one command from the browser-control library.
    ///
    /// Discovery/attach-family commands resolve locally within the same turn;
    /// everything else is forwarded to the relay and answered asynchronously
    /// through the upward stream.
    pub fn send(&self, message: Value) -> Result<()> {
        let command: CdpCommand = serde_json::from_value(message)?;

        if let Some(reply) = self.intercept(&command) {
            let response = match reply {
                LocalReply::Result(result) => {
                    let mut response = json!({"id": command.id, "result": result});
                    if let Some(session_id) = &command.session_id {
                        response["sessionId"] = json!(session_id);
                    }
                    response
                }
                LocalReply::Error(message) => {
                    json!({"id": command.id, "error": {"message": message}})
                }
            };
            return self.push_upward(response);
        }

        self.relay.send_message(
            command.id,
            &command.method,
            command.params,
            command.session_id.as_deref(),
        );
        Ok(())
    }

    /// Tears the adapter down: unsubscribes from the relay and signals
    /// transport-closed upward by ending the stream.
    pub fn close(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.upward.lock().take();
        info!(target = "webmux.adapter", "adapter closed");
    }

    /// Answers discovery/attach-family commands from synthetic state.
    /// Returns `None` for commands that must be forwarded.
    fn intercept(&self, command: &CdpCommand) -> Option<LocalReply> {
        match command.method.as_str() {
            "Target.getBrowserContexts" => Some(LocalReply::Result(json!({"browserContextIds": []}))),
            "Target.getTargets" => {
                let targets: Vec<Value> = self
                    .known_targets()
                    .iter()
                    .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
                    .collect();
                Some(LocalReply::Result(json!({"targetInfos": targets})))
            }
            "Target.getTargetInfo" => Some(self.target_info_reply(command)),
            "Target.attachToTarget" => {
                let Some(target_id) = command.params.get("targetId").and_then(|v| v.as_str()) else {
                    return Some(LocalReply::Error(
                        "targetId is required for Target.attachToTarget".to_string(),
                    ));
                };
                match self.find_target(target_id) {
                    Some(_) => Some(LocalReply::Result(
                        json!({"sessionId": self.session_for(target_id)}),
                    )),
                    None => Some(LocalReply::Error(format!("Target not found: {target_id}"))),
                }
            }
            "Target.setAutoAttach"
            | "Target.setDiscoverTargets"
            | "Target.activateTarget"
            | "Target.detachFromTarget" => Some(LocalReply::Result(json!({}))),
            "Target.closeTarget" => Some(LocalReply::Result(json!({"success": true}))),
            _ => None,
        }
    }

    fn target_info_reply(&self, command: &CdpCommand) -> LocalReply {
        if let Some(target_id) = command.params.get("targetId").and_then(|v| v.as_str()) {
            return match self.find_target(target_id) {
                Some(target) => LocalReply::Result(json!({"targetInfo": target})),
                None => LocalReply::Error(format!("Target not found: {target_id}")),
            };
        }

        if let Some(session_id) = &command.session_id {
            let target_id = {
                let sessions = self.sessions.lock();
                sessions
                    .iter()
                    .find(|(_, sid)| *sid == session_id)
                    .map(|(tid, _)| tid.clone())
            };
            if let Some(target) = target_id.and_then(|tid| self.find_target(&tid)) {
                return LocalReply::Result(json!({"targetInfo": target}));
            }
        }

        // No discriminator: prefer the content target, fall back to the
        // browser pseudo-target.
        let target = self
            .content
            .clone()
            .map(|mut t| {
                t.attached = true;
                t
            })
            .unwrap_or_else(browser_descriptor);
        LocalReply::Result(json!({"targetInfo": target}))
    }

    fn known_targets(&self) -> Vec<TargetDescriptor> {
        let mut targets = vec![browser_descriptor()];
        if let Some(content) = &self.content {
            let mut content = content.clone();
            content.attached = true;
            targets.push(content);
        }
        targets
    }

    fn find_target(&self, target_id: &str) -> Option<TargetDescriptor> {
        self.known_targets()
            .into_iter()
            .find(|t| t.target_id == target_id)
    }

    /// Returns the cached session id for `target_id`, minting it on first
    /// reference.
    fn session_for(&self, target_id: &str) -> String {
        self.sessions
            .lock()
            .entry(target_id.to_string())
            .or_insert_with(|| derive_session_id(target_id))
            .clone()
    }

    fn push_upward(&self, message: Value) -> Result<()> {
        let upward = self.upward.lock();
        let Some(tx) = upward.as_ref() else {
            return Err(Error::ChannelClosed);
        };
        tx.send(message).map_err(|_| Error::ChannelClosed)
    }

    async fn pump_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RelayEvent>,
        upward: mpsc::UnboundedSender<Value>,
    ) {
        self.emit_startup_events(&upward);

        loop {
            match events.recv().await {
                Ok(event) => {
                    if !self.forward_event(&upward, event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "webmux.adapter", skipped, "relay events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        // End the upward stream: dropping the adapter's sender (the pump's
        // clone goes with the task) is the transport-closed signal.
        self.upward.lock().take();
    }

    /// Emits the synthetic startup narrative, strictly ordered: browser
    /// created, content created, browser attached, content attached.
    fn emit_startup_events(&self, upward: &mpsc::UnboundedSender<Value>) {
        let browser = browser_descriptor();
        let _ = upward.send(json!({
            "method": "Target.targetCreated",
            "params": {"targetInfo": browser}
        }));

        let content = self.content.clone().map(|mut t| {
            t.attached = true;
            t
        });
        if let Some(content) = &content {
            let _ = upward.send(json!({
                "method": "Target.targetCreated",
                "params": {"targetInfo": content}
            }));
        }

        let _ = upward.send(json!({
            "method": "Target.attachedToTarget",
            "params": {
                "sessionId": self.session_for(BROWSER_TARGET_ID),
                "targetInfo": browser,
                "waitingForDebugger": false
            }
        }));
        if let Some(content) = &content {
            let _ = upward.send(json!({
                "method": "Target.attachedToTarget",
                "params": {
                    "sessionId": self.session_for(&content.target_id),
                    "targetInfo": content,
                    "waitingForDebugger": false
                }
            }));
        }
    }

    /// Forwards one relay event upward. Returns false when the transport is
    /// closing.
    fn forward_event(&self, upward: &mpsc::UnboundedSender<Value>, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Result { id, value } => {
                let _ = upward.send(json!({"id": id, "result": value}));
            }
            RelayEvent::Error { id, message } => {
                let _ = upward.send(json!({"id": id, "error": {"message": message}}));
            }
            RelayEvent::Protocol {
                method,
                params,
                session_id,
            } => {
                // The adapter owns the attach/detach narrative; the relay's
                // version of it must not leak through.
                if method == "Target.attachedToTarget" || method == "Target.detachedFromTarget" {
                    debug!(target = "webmux.adapter", method, "suppressed relay attachment event");
                    return true;
                }
                let mut message = json!({"method": method, "params": params});
                if let Some(session_id) = session_id {
                    message["sessionId"] = json!(session_id);
                }
                let _ = upward.send(message);
            }
            RelayEvent::Disconnected => {
                info!(target = "webmux.adapter", "relay disconnected, closing transport");
                return false;
            }
            RelayEvent::Detached { reason } => {
                info!(target = "webmux.adapter", reason, "relay detached, closing transport");
                return false;
            }
        }
        true
    }
}
