//! WebSocket client for the Dropwire signaling server.
//!
//! This module provides a client for the Dropwire signaling server, which:
//! - Assigns this connection a session id (`session-created`)
//! - Publishes the list of other live sessions (`peers-updated`)
//! - Relays SDP offers/answers and ICE candidates between sessions
//!
//! The connection is kept alive with WebSocket pings and re-established
//! with exponential backoff. A reconnect yields a new session id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use protocol::{ClientMessage, PeerInfo, RelayKind, ServerMessage};
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::SignalingSink;
use crate::config::DEFAULT_SIGNALING_URL;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Where the client is in its connect/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket is up and messages can be queued.
    Connected,
    /// Waiting out the backoff delay.
    Reconnecting,
}

/// What the client reports to its owner.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    StateChanged(ConnectionState),
    /// The server assigned this connection a session id.
    SessionCreated { session_id: String },
    /// The set of other live sessions changed.
    PeersUpdated { peers: Vec<PeerInfo> },
    /// SDP offer relayed from `from`.
    OfferReceived { offer: Value, from: String },
    /// SDP answer relayed from `from`.
    AnswerReceived { answer: Value, from: String },
    /// ICE candidate relayed from `from`.
    IceCandidateReceived { candidate: Value, from: String },
}

impl From<ServerMessage> for SignalingEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::SessionCreated { session_id } => {
                SignalingEvent::SessionCreated { session_id }
            }
            ServerMessage::PeersUpdated { peers } => SignalingEvent::PeersUpdated { peers },
            ServerMessage::RelayOffer { offer, from } => {
                SignalingEvent::OfferReceived { offer, from }
            }
            ServerMessage::RelayAnswer { answer, from } => {
                SignalingEvent::AnswerReceived { answer, from }
            }
            ServerMessage::RelayIceCandidate { candidate, from } => {
                SignalingEvent::IceCandidateReceived { candidate, from }
            }
        }
    }
}

/// Tuning for [`WebSocketSignalingClient`].
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server.
    pub server_url: String,
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the reconnect delay.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Reconnect when the socket drops.
    pub auto_reconnect: bool,
    /// How often a ping is written.
    pub heartbeat_interval: Duration,
    /// Grace period for the matching pong.
    pub heartbeat_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl SignalingConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Longest silence tolerated before the socket is considered dead.
    fn liveness_limit(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_timeout
    }
}

/// Exponential reconnect delay.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    fn new(config: &SignalingConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
            current: config.initial_backoff,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why a connected socket stopped being served.
#[derive(Debug)]
enum LinkEnd {
    Shutdown,
    HeartbeatLost,
    Dropped(ProtocolError),
}

/// One live WebSocket connection.
struct Link {
    /// Frames queued for the writer task, text and control alike.
    outbox: mpsc::Sender<WsMessage>,
    /// Decoded server messages, or the error that ended the read side.
    inbound: mpsc::Receiver<Result<ServerMessage>>,
    /// Time of the most recent pong.
    last_pong: watch::Receiver<Instant>,
}

#[derive(Default)]
struct Shared {
    session_id: Option<String>,
    display_name: Option<String>,
    outbox: Option<mpsc::Sender<WsMessage>>,
}

/// Signaling client over a reconnecting WebSocket.
pub struct WebSocketSignalingClient {
    config: SignalingConfig,
    shared: RwLock<Shared>,
    state: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<SignalingEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
    shutdown: CancellationToken,
}

impl WebSocketSignalingClient {
    pub fn new(config: SignalingConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            shared: RwLock::new(Shared::default()),
            state: watch::Sender::new(ConnectionState::Disconnected),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Takes the event stream. Only the first call gets it.
    pub fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>> {
        self.event_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Session id of the current connection, if one was assigned.
    pub async fn session_id(&self) -> Option<String> {
        self.shared.read().await.session_id.clone()
    }

    /// Remembers the display name and announces it when connected.
    ///
    /// The name is re-sent after every reconnect since the server treats
    /// each connection as a fresh session.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.shared.write().await.display_name = Some(name.to_string());

        if self.state() == ConnectionState::Connected {
            self.queue(ClientMessage::SetName {
                name: name.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// Spawns the connection loop.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(self.run());
    }

    /// Stops the connection loop and closes the socket.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        self.forget_link().await;
    }

    async fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed && self.event_tx.send(SignalingEvent::StateChanged(next)).await.is_err() {
            tracing::debug!(state = ?next, "Signaling event receiver dropped");
        }
    }

    async fn queue(&self, message: ClientMessage) -> Result<()> {
        let outbox = self.shared.read().await.outbox.clone().ok_or_else(|| {
            ProtocolError::ConnectionClosed("not connected to signaling server".to_string())
        })?;
        let json = message.to_json()?;
        outbox
            .send(WsMessage::Text(json))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("signaling writer stopped".to_string()))
    }

    async fn forget_link(&self) {
        let mut shared = self.shared.write().await;
        shared.outbox = None;
        shared.session_id = None;
    }

    async fn dispatch(&self, message: ServerMessage) {
        if let ServerMessage::SessionCreated { session_id } = &message {
            tracing::info!(session_id = %session_id, "Signaling session created");
            self.shared.write().await.session_id = Some(session_id.clone());
        }

        if self.event_tx.send(message.into()).await.is_err() {
            tracing::debug!("Signaling event receiver dropped");
        }
    }

    fn endpoint(&self) -> Result<Url> {
        Url::parse(&self.config.server_url)
            .map_err(|e| ProtocolError::NegotiationFailed(format!("invalid signaling URL: {}", e)))
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(&self.config);

        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting).await;

            match self.open().await {
                Ok(link) => {
                    backoff.reset();
                    let name = {
                        let mut shared = self.shared.write().await;
                        shared.outbox = Some(link.outbox.clone());
                        shared.display_name.clone()
                    };
                    self.set_state(ConnectionState::Connected).await;

                    if let Some(name) = name {
                        if let Err(e) = self.queue(ClientMessage::SetName { name }).await {
                            tracing::warn!("Failed to announce display name: {}", e);
                        }
                    }

                    let end = self.serve(link).await;
                    self.forget_link().await;
                    match end {
                        LinkEnd::Shutdown => break,
                        LinkEnd::HeartbeatLost => tracing::warn!("Signaling heartbeat lost"),
                        LinkEnd::Dropped(e) => tracing::warn!("Signaling connection dropped: {}", e),
                    }
                }
                Err(e) => tracing::error!("Signaling connection failed: {}", e),
            }

            if !self.config.auto_reconnect || self.shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Reconnecting).await;
            tracing::info!(delay = ?delay, "Reconnecting to signaling server");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Pumps one connection until it ends.
    async fn serve(&self, mut link: Link) -> LinkEnd {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = link.outbox.send(WsMessage::Close(None)).await;
                    return LinkEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if link.last_pong.borrow().elapsed() > self.config.liveness_limit() {
                        return LinkEnd::HeartbeatLost;
                    }
                    if link.outbox.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        return LinkEnd::Dropped(ProtocolError::ConnectionClosed(
                            "signaling writer stopped".to_string(),
                        ));
                    }
                }
                inbound = link.inbound.recv() => match inbound {
                    Some(Ok(message)) => self.dispatch(message).await,
                    Some(Err(e)) => return LinkEnd::Dropped(e),
                    None => {
                        return LinkEnd::Dropped(ProtocolError::ConnectionClosed(
                            "signaling reader stopped".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Dials the server and spawns the reader and writer halves.
    async fn open(&self) -> Result<Link> {
        let endpoint = self.endpoint()?;
        tracing::info!(url = %endpoint, "Connecting to signaling server");

        let (socket, _) = connect_async(endpoint.as_str()).await.map_err(|e| match e {
            WsError::Io(io) => ProtocolError::from(io),
            other => ProtocolError::ConnectionClosed(format!("WebSocket handshake failed: {}", other)),
        })?;
        let (mut sink, mut stream) = socket.split();

        let (outbox, mut outbox_rx) = mpsc::channel::<WsMessage>(256);
        let (inbound_tx, inbound) = mpsc::channel::<Result<ServerMessage>>(256);
        let (pong_tx, last_pong) = watch::channel(Instant::now());

        tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!("Signaling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let end = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(message) => {
                            if inbound_tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed signaling message: {}", e),
                    },
                    Some(Ok(WsMessage::Pong(_))) => {
                        pong_tx.send_replace(Instant::now());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        break ProtocolError::ConnectionClosed("server closed connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break ProtocolError::ConnectionClosed(format!("WebSocket error: {}", e));
                    }
                }
            };
            let _ = inbound_tx.send(Err(end)).await;
        });

        Ok(Link {
            outbox,
            inbound,
            last_pong,
        })
    }
}

impl SignalingSink for WebSocketSignalingClient {
    fn relay<'a>(
        &'a self,
        kind: RelayKind,
        payload: Value,
        peer_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.queue(ClientMessage::relay(kind, payload, peer_id)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signaling_config_default() {
        let config = SignalingConfig::default();
        assert_eq!(config.server_url, DEFAULT_SIGNALING_URL);
        assert!(config.auto_reconnect);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.max_backoff, Duration::from_millis(30_000));
    }

    #[test]
    fn test_signaling_config_overrides() {
        let config = SignalingConfig::new("wss://relay.lan:3001")
            .with_auto_reconnect(false)
            .with_initial_backoff(Duration::from_millis(250))
            .with_max_backoff(Duration::from_secs(5));

        assert_eq!(config.server_url, "wss://relay.lan:3001");
        assert!(!config.auto_reconnect);
        assert_eq!(config.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
        assert_eq!(config.liveness_limit(), Duration::from_secs(40));
    }

    #[test]
    fn test_server_message_into_event() {
        let event: SignalingEvent = ServerMessage::RelayOffer {
            offer: json!({"type": "offer", "sdp": "v=0"}),
            from: "aaa".to_string(),
        }
        .into();
        match event {
            SignalingEvent::OfferReceived { offer, from } => {
                assert_eq!(from, "aaa");
                assert_eq!(offer["type"], "offer");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let event: SignalingEvent = ServerMessage::SessionCreated {
            session_id: "xyz".to_string(),
        }
        .into();
        assert!(matches!(event, SignalingEvent::SessionCreated { session_id } if session_id == "xyz"));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = WebSocketSignalingClient::new(SignalingConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_events_receiver_taken_once() {
        let client = WebSocketSignalingClient::new(SignalingConfig::default());
        assert!(client.events().is_some());
        assert!(client.events().is_none());
    }

    #[tokio::test]
    async fn test_relay_when_disconnected_fails() {
        let client = WebSocketSignalingClient::new(SignalingConfig::default());
        let result = client
            .relay(RelayKind::Offer, json!({"type": "offer", "sdp": ""}), "bbb")
            .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_set_name_while_disconnected_is_stored() {
        let client = WebSocketSignalingClient::new(SignalingConfig::default());
        client.set_name("Laptop").await.unwrap();
        assert_eq!(
            client.shared.read().await.display_name.as_deref(),
            Some("Laptop")
        );
    }

    #[test]
    fn test_invalid_server_url() {
        let client = WebSocketSignalingClient::new(SignalingConfig::new("not a url"));
        assert!(client.endpoint().is_err());
    }

    #[test]
    fn test_backoff_grows_to_cap_and_resets() {
        let config = SignalingConfig::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));
        let mut backoff = Backoff::new(&config);

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unreachable_server_without_reconnect_ends_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Arc::new(WebSocketSignalingClient::new(
            SignalingConfig::new(format!("ws://{}", addr)).with_auto_reconnect(false),
        ));
        let mut events = client.events().unwrap();
        client.clone().start();

        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), events.recv()).await
        {
            if let SignalingEvent::StateChanged(state) = event {
                seen.push(state);
                if state == ConnectionState::Disconnected {
                    break;
                }
            }
        }
        assert_eq!(
            seen,
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }
}
