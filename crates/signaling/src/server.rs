//! WebSocket signaling server.
//!
//! Each accepted TCP connection is upgraded to a WebSocket and bound to one
//! session in the [`SessionRegistry`]. A writer task drains the session's
//! outbound queue and sends heartbeat pings; the reader loop dispatches
//! `set-name` and relay requests until the socket closes, goes idle for two
//! heartbeat intervals or the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use crate::relay::{relay, RelayOutcome};

/// Outbound queue handle stored in the registry for each connection.
pub type SessionHandle = mpsc::UnboundedSender<ServerMessage>;

/// The signaling server.
pub struct SignalingServer {
    registry: Arc<SessionRegistry<SessionHandle>>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
}

impl SignalingServer {
    /// Creates a server from its configuration.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.max_sessions)),
            heartbeat_interval: config.heartbeat_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the session registry.
    pub fn registry(&self) -> Arc<SessionRegistry<SessionHandle>> {
        Arc::clone(&self.registry)
    }

    /// Returns a token that stops the accept loop and all connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds `addr` and serves until shutdown.
    pub async fn bind_and_serve(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().context("Listener has no address")?;
        tracing::info!("Signaling server listening on ws://{}", local_addr);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Signaling server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let registry = Arc::clone(&self.registry);
                    let heartbeat = self.heartbeat_interval;
                    let shutdown = self.shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, registry, heartbeat, shutdown).await
                        {
                            tracing::debug!(%peer_addr, "Connection ended with error: {:#}", e);
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

/// Serves one WebSocket connection for its whole lifetime.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry<SessionHandle>>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let session_id = match registry.register(tx) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(%peer_addr, "Rejecting connection: {}", e);
            let _ = ws_sink.send(WsMessage::Close(None)).await;
            return Ok(());
        }
    };
    tracing::debug!(%peer_addr, session_id = %session_id, "Connection accepted");

    // Writer: drains the queue and pings. Ends once the registry drops the
    // sender or the socket fails.
    let writer_id = session_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(session_id = %writer_id, "Failed to serialize: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                        tracing::debug!(session_id = %writer_id, "Send failed: {}", e);
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = ws_sink.close().await;
    });

    let idle_timeout = heartbeat_interval * 2;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = tokio::time::timeout(idle_timeout, ws_source.next()) => frame,
        };

        let msg = match frame {
            Err(_) => {
                tracing::info!(session_id = %session_id, "Connection idle, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            WsMessage::Text(text) => dispatch(&registry, &session_id, &text),
            WsMessage::Close(_) => break,
            // Pong and Ping only keep the idle timer alive.
            _ => {}
        }
    }

    registry.remove(&session_id);
    // Removal dropped the queue sender, so the writer finishes on its own.
    let _ = writer.await;
    tracing::debug!(%peer_addr, session_id = %session_id, "Connection closed");
    Ok(())
}

/// Handles one text frame from session `session_id`.
fn dispatch(registry: &SessionRegistry<SessionHandle>, session_id: &str, text: &str) {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(session_id = %session_id, "Ignoring malformed message: {}", e);
            return;
        }
    };

    match message {
        ClientMessage::SetName { name } => {
            if let Err(e) = registry.rename(session_id, &name) {
                tracing::warn!(session_id = %session_id, "Rename failed: {}", e);
            }
        }
        other => {
            if let Some((kind, payload, to)) = other.into_relay() {
                let _: RelayOutcome = relay(registry, kind, payload, session_id, &to);
            }
        }
    }
}
