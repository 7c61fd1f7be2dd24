//! Integration tests for Primary election and the Secondary relay, against
//! real websocket servers on ephemeral ports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use webmux_core::bridge::{BridgeConfig, Role, SecondaryBridge, elect_role};
use webmux_core::error::Error;
use webmux_core::lock::LockRegistry;
use webmux_core::probe::ProbeClient;
use webmux_protocol::{HealthResponse, LockRecord};

#[derive(Clone)]
struct AppState {
    instance: String,
    kill: watch::Receiver<bool>,
    closes: Arc<AtomicUsize>,
}

/// A fake Primary that echoes every rpc line back prefixed with its
/// instance id, so tests can tell which Primary answered.
struct PrimaryHandle {
    port: u16,
    instance: String,
    serve: JoinHandle<()>,
    kill: watch::Sender<bool>,
    closes: Arc<AtomicUsize>,
}

impl PrimaryHandle {
    fn record(&self) -> LockRecord {
        LockRecord {
            pid: std::process::id(),
            port: self.port,
            instance_id: self.instance.clone(),
            timestamp_ms: 0,
        }
    }

    /// Simulates a crash: stops accepting and drops open connections.
    fn kill(&self) {
        let _ = self.kill.send(true);
        self.serve.abort();
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.instance.clone()))
}

async fn session_close(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.closes.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "ok": true }))
}

async fn rpc(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| echo(socket, state))
}

async fn echo(mut socket: WebSocket, state: AppState) {
    let mut kill = state.kill.clone();
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = format!("{}:{}", state.instance, text.as_str());
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = kill.changed() => break,
        }
    }
}

async fn spawn_primary(instance: &str) -> PrimaryHandle {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (kill_tx, kill_rx) = watch::channel(false);
    let closes = Arc::new(AtomicUsize::new(0));
    let state = AppState {
        instance: instance.to_string(),
        kill: kill_rx,
        closes: closes.clone(),
    };
    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/rpc", get(rpc))
        .route("/session/close", post(session_close))
        .with_state(state);
    let serve = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    PrimaryHandle {
        port,
        instance: instance.to_string(),
        serve,
        kill: kill_tx,
        closes,
    }
}

/// Binds and immediately drops a listener to find a port nothing serves on.
async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn registry_in(dir: &tempfile::TempDir) -> LockRegistry {
    LockRegistry::new(dir.path().join("webmux.lock"))
}

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        max_attempts: 3,
        retry_base: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn elect_role_with_no_lock_is_primary() {
    let dir = tempfile::tempdir().unwrap();
    let role = elect_role(&registry_in(&dir), &ProbeClient::new()).await;
    assert!(matches!(role, Role::Primary));
}

#[tokio::test]
async fn elect_role_follows_live_lock() {
    let primary = spawn_primary("alpha").await;
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.write(&primary.record()).unwrap();

    let role = elect_role(&registry, &ProbeClient::new()).await;
    match role {
        Role::Secondary(record) => assert_eq!(record.port, primary.port),
        Role::Primary => panic!("expected Secondary against a live Primary"),
    }
}

#[tokio::test]
async fn elect_role_treats_identity_mismatch_as_stale() {
    let primary = spawn_primary("alpha").await;
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    let mut record = primary.record();
    record.instance_id = "somebody-else".to_string();
    registry.write(&record).unwrap();

    let role = elect_role(&registry, &ProbeClient::new()).await;
    assert!(matches!(role, Role::Primary));
}

#[tokio::test]
async fn elect_role_treats_dead_endpoint_as_stale() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry
        .write(&LockRecord {
            pid: std::process::id(),
            port: dead_port().await,
            instance_id: "gone".to_string(),
            timestamp_ms: 0,
        })
        .unwrap();

    let role = elect_role(&registry, &ProbeClient::new()).await;
    assert!(matches!(role, Role::Primary));
}

#[tokio::test]
async fn relays_lines_in_order_and_exits_cleanly_on_ingress_eof() {
    let primary = spawn_primary("alpha").await;
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.write(&primary.record()).unwrap();

    let (mut ingress_tx, ingress_rx) = tokio::io::duplex(4096);
    let (egress_tx, egress_rx) = tokio::io::duplex(4096);

    let record = primary.record();
    let bridge_task = tokio::spawn(async move {
        let bridge = SecondaryBridge::new(registry, ProbeClient::new(), fast_config());
        bridge.run(record, ingress_rx, egress_tx).await
    });

    for i in 0..10 {
        ingress_tx
            .write_all(format!("msg-{i}\n").as_bytes())
            .await
            .unwrap();
    }

    let mut replies = BufReader::new(egress_rx).lines();
    for i in 0..10 {
        let line = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, format!("alpha:msg-{i}"));
    }

    drop(ingress_tx);
    let result = tokio::time::timeout(Duration::from_secs(5), bridge_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(primary.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recovers_by_following_the_lock_record() {
    let first = spawn_primary("alpha").await;
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.write(&first.record()).unwrap();

    let (mut ingress_tx, ingress_rx) = tokio::io::duplex(4096);
    let (egress_tx, egress_rx) = tokio::io::duplex(4096);

    let record = first.record();
    let bridge_registry = LockRegistry::new(registry.path().to_path_buf());
    let bridge_task = tokio::spawn(async move {
        let bridge = SecondaryBridge::new(bridge_registry, ProbeClient::new(), fast_config());
        bridge.run(record, ingress_rx, egress_tx).await
    });
    let mut replies = BufReader::new(egress_rx).lines();

    ingress_tx.write_all(b"one\n").await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "alpha:one");

    // Restarted Primary on a new port under a new identity.
    let second = spawn_primary("bravo").await;
    registry.write(&second.record()).unwrap();
    first.kill();

    // Give the relay time to notice the loss and reconnect.
    tokio::time::sleep(Duration::from_millis(500)).await;

    ingress_tx.write_all(b"two\n").await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "bravo:two");

    drop(ingress_tx);
    let result = tokio::time::timeout(Duration::from_secs(5), bridge_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn exhausted_recovery_reports_unreachable() {
    let primary = spawn_primary("alpha").await;
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(&dir);
    registry.write(&primary.record()).unwrap();

    let (mut ingress_tx, ingress_rx) = tokio::io::duplex(4096);
    let (egress_tx, egress_rx) = tokio::io::duplex(4096);

    let record = primary.record();
    let bridge_registry = LockRegistry::new(registry.path().to_path_buf());
    let bridge_task = tokio::spawn(async move {
        let bridge = SecondaryBridge::new(bridge_registry, ProbeClient::new(), fast_config());
        bridge.run(record, ingress_rx, egress_tx).await
    });
    let mut replies = BufReader::new(egress_rx).lines();

    ingress_tx.write_all(b"one\n").await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "alpha:one");

    // Primary dies and never comes back; the stale record stays behind.
    primary.kill();

    let result = tokio::time::timeout(Duration::from_secs(10), bridge_task)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(Error::PrimaryUnreachable { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected PrimaryUnreachable, got {other:?}"),
    }

    // Keep the ingress writer alive until the bridge has exited.
    drop(ingress_tx);
}
