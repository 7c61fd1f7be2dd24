//! Instance arbitration: one Primary per host, everyone else relays to it.
//!
//! At startup each process reads the lock record and probes the endpoint it
//! names. No record, an unreachable endpoint, or an identity mismatch all
//! mean the record is stale and this process becomes Primary. A live,
//! matching endpoint means Secondary: the process relays its ingress channel
//! bytewise to the Primary and stays out of the payload entirely.
//!
//! When the Primary connection drops, recovery follows the leader: every
//! attempt re-reads the lock record, because a restarted Primary may have
//! come back on a different port under a new instance id.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use webmux_protocol::LockRecord;

use crate::error::{Error, Result};
use crate::lock::LockRegistry;
use crate::probe::{ProbeClient, RPC_PATH};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome of startup arbitration.
#[derive(Debug)]
pub enum Role {
    /// This process owns the real browser connection.
    Primary,
    /// Another live process owns it; relay to the recorded endpoint.
    Secondary(LockRecord),
}

/// Recovery policy for a Secondary that lost its Primary.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

/// Decides Primary vs Secondary for this process.
pub async fn elect_role(registry: &LockRegistry, probe: &ProbeClient) -> Role {
    let Some(record) = registry.read() else {
        debug!(target = "webmux.bridge", "no lock record, becoming Primary");
        return Role::Primary;
    };

    if probe.verify(&record).await {
        info!(
            target = "webmux.bridge",
            port = record.port,
            instance = %record.instance_id,
            "live Primary found, becoming Secondary"
        );
        Role::Secondary(record)
    } else {
        info!(
            target = "webmux.bridge",
            port = record.port,
            "recorded Primary is stale, becoming Primary"
        );
        Role::Primary
    }
}

enum RelayOutcome {
    /// The ingress client went away; shut down cleanly.
    IngressClosed,
    /// The Primary connection dropped; enter recovery.
    LinkLost,
}

/// The Secondary's relay: ingress channel <-> Primary websocket.
pub struct SecondaryBridge {
    registry: LockRegistry,
    probe: ProbeClient,
    config: BridgeConfig,
}

impl SecondaryBridge {
    pub fn new(registry: LockRegistry, probe: ProbeClient, config: BridgeConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Relays until the ingress channel closes (`Ok`) or recovery exhausts
    /// its attempts (`Err`, the caller exits non-zero).
    ///
    /// Messages are newline-delimited on the ingress side and text frames on
    /// the websocket side; the payload is never inspected and per-direction
    /// ordering is preserved. A message in flight when the link drops is
    /// lost, not replayed: recovery only restores the pipe.
    pub async fn run<R, W>(&self, record: LockRecord, ingress: R, egress: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(ingress).lines();
        let mut egress = egress;

        let mut current = record;
        let mut ws = match self.connect(current.port).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(target = "webmux.bridge", error = %err, "initial Primary connection failed");
                let (ws, found) = self.recover().await?;
                current = found;
                ws
            }
        };

        loop {
            match self.relay_until_loss(&mut lines, &mut egress, ws, current.port).await? {
                RelayOutcome::IngressClosed => return Ok(()),
                RelayOutcome::LinkLost => {
                    let (new_ws, found) = self.recover().await?;
                    current = found;
                    ws = new_ws;
                }
            }
        }
    }

    async fn relay_until_loss<R, W>(
        &self,
        lines: &mut tokio::io::Lines<BufReader<R>>,
        egress: &mut W,
        ws: WsStream,
        port: u16,
    ) -> Result<RelayOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Err(err) = ws_tx.send(Message::Text(line)).await {
                            warn!(target = "webmux.bridge", error = %err, "forward to Primary failed");
                            return Ok(RelayOutcome::LinkLost);
                        }
                    }
                    None => {
                        info!(target = "webmux.bridge", "ingress closed, shutting down");
                        if let Err(err) = self.probe.request_session_close(port).await {
                            debug!(target = "webmux.bridge", error = %err, "session close call failed");
                        }
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(RelayOutcome::IngressClosed);
                    }
                },
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        egress.write_all(text.as_bytes()).await?;
                        egress.write_all(b"\n").await?;
                        egress.flush().await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        egress.write_all(&data).await?;
                        egress.write_all(b"\n").await?;
                        egress.flush().await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(target = "webmux.bridge", "Primary connection closed");
                        return Ok(RelayOutcome::LinkLost);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(target = "webmux.bridge", error = %err, "Primary connection error");
                        return Ok(RelayOutcome::LinkLost);
                    }
                },
            }
        }
    }

    /// Follow-the-leader recovery: re-read the lock record, probe, reconnect.
    async fn recover(&self) -> Result<(WsStream, LockRecord)> {
        for attempt in 1..=self.config.max_attempts {
            if let Some(record) = self.registry.read() {
                if self.probe.verify(&record).await {
                    match self.connect(record.port).await {
                        Ok(ws) => {
                            info!(
                                target = "webmux.bridge",
                                attempt,
                                port = record.port,
                                "reconnected to Primary"
                            );
                            return Ok((ws, record));
                        }
                        Err(err) => {
                            warn!(target = "webmux.bridge", attempt, error = %err, "reconnect failed");
                        }
                    }
                } else {
                    debug!(target = "webmux.bridge", attempt, port = record.port, "recorded Primary not reachable");
                }
            } else {
                debug!(target = "webmux.bridge", attempt, "no lock record during recovery");
            }

            if attempt < self.config.max_attempts {
                let delay = self.config.retry_base * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::PrimaryUnreachable {
            attempts: self.config.max_attempts,
        })
    }

    async fn connect(&self, port: u16) -> Result<WsStream> {
        let url = format!("ws://127.0.0.1:{port}{RPC_PATH}");
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|err| Error::PrimaryConnection(err.to_string()))?;
        debug!(target = "webmux.bridge", port, "connected to Primary");
        Ok(ws)
    }
}
