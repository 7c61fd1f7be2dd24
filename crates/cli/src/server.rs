//! Primary endpoint: health probe, session-close control route, and the
//! websocket rpc ingress feeding the shared serializer.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use webmux_core::probe::{HEALTH_PATH, RPC_PATH, SESSION_CLOSE_PATH};
use webmux_core::serializer::{ExecFuture, Serializer};
use webmux_protocol::{HealthResponse, ToolCallRequest, ToolCallResponse, ToolResult};

const PORT_RANGE_START: u16 = 9400;
const PORT_RANGE_END: u16 = 9499;

/// Produces the handler body for one tool call. The body only starts running
/// once the serializer dequeues it.
pub trait ToolDispatcher: Send + Sync {
    fn dispatch(&self, request: &ToolCallRequest) -> ExecFuture;
}

/// Fallback dispatcher for builds without a tool catalog wired in.
pub struct UnavailableDispatcher;

impl ToolDispatcher for UnavailableDispatcher {
    fn dispatch(&self, request: &ToolCallRequest) -> ExecFuture {
        let name = request.name.clone();
        Box::pin(async move {
            Ok(ToolResult::error(format!(
                "tool '{name}' is not available in this build"
            )))
        })
    }
}

#[derive(Clone)]
pub struct ServerContext {
    pub serializer: Arc<Serializer>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub instance_id: String,
}

/// Binds the requested port, or the first free port in the service range.
pub async fn bind(preferred: Option<u16>) -> Result<(TcpListener, u16)> {
    if let Some(port) = preferred {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind requested port {port}"))?;
        return Ok((listener, port));
    }
    for port in PORT_RANGE_START..=PORT_RANGE_END {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok((listener, port));
        }
    }
    anyhow::bail!("no free port in {PORT_RANGE_START}..={PORT_RANGE_END}")
}

pub fn router(context: ServerContext) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(RPC_PATH, get(rpc_upgrade))
        .route(SESSION_CLOSE_PATH, post(session_close))
        .with_state(context)
}

pub async fn serve(listener: TcpListener, context: ServerContext) -> Result<()> {
    let port = listener.local_addr()?.port();
    info!(target = "webmux", port, "Primary endpoint listening");
    axum::serve(listener, router(context).into_make_service())
        .await
        .context("Primary endpoint error")
}

async fn health(State(context): State<ServerContext>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(context.instance_id.clone()))
}

async fn session_close() -> StatusCode {
    // Tool sessions are owned by the dispatcher's collaborators; the route
    // exists so a departing Secondary has somewhere to report to.
    info!(target = "webmux", "session close requested");
    StatusCode::OK
}

async fn rpc_upgrade(
    State(context): State<ServerContext>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_rpc_socket(socket, context))
}

async fn handle_rpc_socket(mut socket: WebSocket, context: ServerContext) {
    debug!(target = "webmux", "rpc client connected");
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let reply =
                    execute_line(&context.serializer, context.dispatcher.as_ref(), text.as_str())
                        .await;
                let Some(reply) = reply else { continue };
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(target = "webmux", error = %err, "rpc client connection error");
                break;
            }
        }
    }
    debug!(target = "webmux", "rpc client disconnected");
}

/// Runs one tool-call line through the shared serializer and serializes the
/// response. Both ingress paths (stdio and the rpc websocket) funnel through
/// here, so they share one global FIFO.
///
/// Returns `None` for lines malformed beyond recovering a request id to
/// answer on; those are logged and dropped.
pub async fn execute_line(
    serializer: &Arc<Serializer>,
    dispatcher: &dyn ToolDispatcher,
    line: &str,
) -> Option<String> {
    let request: ToolCallRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(target = "webmux", error = %err, "malformed tool call");
            let id = serde_json::from_str::<serde_json::Value>(line)
                .ok()?
                .get("id")?
                .as_u64()?;
            let response = ToolCallResponse {
                id,
                result: ToolResult::error(format!("malformed tool call: {err}")),
            };
            return serde_json::to_string(&response).ok();
        }
    };

    let exec = dispatcher.dispatch(&request);
    let result = serializer.submit(request.name.clone(), exec).await;
    let response = ToolCallResponse {
        id: request.id,
        result,
    };
    serde_json::to_string(&response).ok()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use webmux_core::error::Result as CoreResult;
    use webmux_core::probe::ProbeClient;
    use webmux_core::serializer::ShutdownHooks;

    use super::*;

    struct NoopHooks;

    #[async_trait]
    impl ShutdownHooks for NoopHooks {
        async fn notify_companion(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn release_resources(&self) -> CoreResult<()> {
            Ok(())
        }

        fn terminate(&self, _code: i32) {}
    }

    struct EchoDispatcher;

    impl ToolDispatcher for EchoDispatcher {
        fn dispatch(&self, request: &ToolCallRequest) -> ExecFuture {
            let name = request.name.clone();
            let arguments = request.arguments.clone();
            Box::pin(async move { Ok(ToolResult::text(format!("{name}:{arguments}"))) })
        }
    }

    async fn spawn_server(dispatcher: Arc<dyn ToolDispatcher>) -> (u16, String) {
        let (listener, port) = bind(None).await.unwrap();
        let instance_id = "test-instance".to_string();
        let context = ServerContext {
            serializer: Arc::new(Serializer::new(None, Arc::new(NoopHooks))),
            dispatcher,
            instance_id: instance_id.clone(),
        };
        tokio::spawn(serve(listener, context));
        (port, instance_id)
    }

    #[tokio::test]
    async fn bind_scans_the_service_range() {
        let (_listener, port) = bind(None).await.unwrap();
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
    }

    #[tokio::test]
    async fn health_reports_instance_identity() {
        let (port, instance_id) = spawn_server(Arc::new(UnavailableDispatcher)).await;

        let health = ProbeClient::new().probe(port).await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.instance_id.as_deref(), Some(instance_id.as_str()));
    }

    #[tokio::test]
    async fn rpc_round_trips_tool_calls() {
        let (port, _) = spawn_server(Arc::new(EchoDispatcher)).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}{RPC_PATH}"))
            .await
            .unwrap();
        ws.send(WsMessage::Text(
            r#"{"id":7,"name":"navigate","arguments":{"url":"https://example.com"}}"#.to_string(),
        ))
        .await
        .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let response: ToolCallResponse =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(response.id, 7);
        assert!(!response.result.is_error);
        assert_eq!(
            response.result.content,
            r#"navigate:{"url":"https://example.com"}"#
        );
    }

    #[tokio::test]
    async fn malformed_call_with_recoverable_id_gets_an_error_response() {
        let (port, _) = spawn_server(Arc::new(EchoDispatcher)).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}{RPC_PATH}"))
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"id":3,"nam":"oops"}"#.to_string()))
            .await
            .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let response: ToolCallResponse =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(response.id, 3);
        assert!(response.result.is_error);
        assert!(response.result.content.contains("malformed tool call"));
    }

    #[tokio::test]
    async fn garbage_line_is_dropped_without_a_response() {
        let serializer = Arc::new(Serializer::new(None, Arc::new(NoopHooks)));
        let reply = execute_line(&serializer, &EchoDispatcher, "not json at all").await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn default_dispatcher_reports_tools_unavailable() {
        let serializer = Arc::new(Serializer::new(None, Arc::new(NoopHooks)));
        let reply = execute_line(
            &serializer,
            &UnavailableDispatcher,
            r#"{"id":1,"name":"navigate"}"#,
        )
        .await
        .unwrap();

        let response: ToolCallResponse = serde_json::from_str(&reply).unwrap();
        assert!(response.result.is_error);
        assert!(response.result.content.contains("not available"));
    }
}
