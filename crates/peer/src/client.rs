//! Peer client: wires the signaling client, negotiator and transfer engine.
//!
//! One event-loop task consumes signaling events and transport events:
//!
//! - `session-created` sets the local id used for glare resolution
//! - a peer disappearing from `peers-updated` closes its connection and
//!   fails its unfinished transfers
//! - relayed offers, answers and candidates go to the [`Negotiator`]
//! - data-channel messages go to the [`TransferEngine`]
//! - channel close or connection failure fails the peer's transfers

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use protocol::PeerInfo;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ClientError, TransferError};
use crate::negotiator::{Negotiator, NegotiatorConfig};
use crate::network::{
    IceServer, SignalingConfig, SignalingEvent, SignalingSink, TransportEvent, TransportEventKind,
    TransportFactory, WebRtcConfig, WebRtcTransportFactory, WebSocketSignalingClient,
};
use crate::transfer::{EngineSettings, OutgoingFile, Transfer, TransferEngine, TransferStatus};

/// Reason recorded on transfers whose peer left the session list.
const PEER_LEFT: &str = "peer disconnected";

/// Reason recorded on transfers whose data channel closed.
const CHANNEL_CLOSED: &str = "data channel closed";

/// A running Dropwire client.
pub struct PeerClient {
    signaling: Arc<WebSocketSignalingClient>,
    negotiator: Arc<Negotiator>,
    engine: TransferEngine,
    peers: watch::Sender<Vec<PeerInfo>>,
    session_id: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
}

impl PeerClient {
    /// Connects to the configured signaling server using WebRTC transports.
    pub async fn start(config: &Config) -> anyhow::Result<Arc<Self>> {
        let ice_servers: Vec<IceServer> =
            config.network.ice_servers.iter().map(IceServer::from).collect();
        let factory = WebRtcTransportFactory::new(WebRtcConfig::with_ice_servers(ice_servers))
            .context("Failed to initialise WebRTC")?;
        Self::start_with_factory(config, Arc::new(factory)).await
    }

    /// Connects using a custom transport factory.
    pub async fn start_with_factory(
        config: &Config,
        factory: Arc<dyn TransportFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        let signaling = Arc::new(WebSocketSignalingClient::new(SignalingConfig::new(
            config.network.signaling_url.clone(),
        )));
        let signaling_events = signaling
            .events()
            .context("Signaling event stream already taken")?;

        if let Some(name) = &config.general.display_name {
            signaling
                .set_name(name)
                .await
                .context("Failed to set display name")?;
        }

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn SignalingSink> = signaling.clone();
        let negotiator = Arc::new(Negotiator::new(
            factory,
            sink,
            transport_tx,
            NegotiatorConfig {
                wait_interval: config.network.channel_wait_interval(),
                wait_attempts: config.network.channel_wait_attempts,
            },
        ));
        let engine = TransferEngine::new(EngineSettings::from(&config.transfer));

        let client = Arc::new(Self {
            signaling: signaling.clone(),
            negotiator,
            engine,
            peers: watch::Sender::new(Vec::new()),
            session_id: watch::Sender::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(client.clone().run(signaling_events, transport_rx));
        signaling.start();

        tracing::info!(server = %config.network.signaling_url, "Peer client started");
        Ok(client)
    }

    async fn run(
        self: Arc<Self>,
        mut signaling_events: mpsc::Receiver<SignalingEvent>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = signaling_events.recv() => match event {
                    Some(event) => self.on_signaling_event(event).await,
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Client event loop stopped");
    }

    async fn on_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::StateChanged(state) => {
                tracing::info!(state = ?state, "Signaling connection state changed");
            }
            SignalingEvent::SessionCreated { session_id } => {
                tracing::info!(session_id = %session_id, "Joined session");
                self.negotiator.set_local_id(&session_id);
                self.session_id.send_replace(Some(session_id));
            }
            SignalingEvent::PeersUpdated { peers } => {
                let current: HashSet<&str> = peers.iter().map(|p| p.id.as_str()).collect();
                let departed: Vec<String> = self
                    .peers
                    .borrow()
                    .iter()
                    .filter(|p| !current.contains(p.id.as_str()))
                    .map(|p| p.id.clone())
                    .collect();

                for peer_id in departed {
                    tracing::info!(peer_id = %peer_id, "Peer left");
                    self.negotiator.close(&peer_id).await;
                    self.engine.fail_peer(&peer_id, PEER_LEFT);
                }
                self.peers.send_replace(peers);
            }
            SignalingEvent::OfferReceived { offer, from } => {
                if let Err(e) = self.negotiator.on_offer_received(&from, offer).await {
                    tracing::warn!(peer_id = %from, "Failed to handle offer: {}", e);
                }
            }
            SignalingEvent::AnswerReceived { answer, from } => {
                if let Err(e) = self.negotiator.on_answer_received(&from, answer).await {
                    tracing::warn!(peer_id = %from, "Failed to handle answer: {}", e);
                }
            }
            SignalingEvent::IceCandidateReceived { candidate, from } => {
                if let Err(e) = self
                    .negotiator
                    .on_ice_candidate_received(&from, candidate)
                    .await
                {
                    tracing::warn!(peer_id = %from, "Failed to handle candidate: {}", e);
                }
            }
        }
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        let Some(event) = self.negotiator.handle_transport_event(event).await else {
            return;
        };

        match event.kind {
            TransportEventKind::Message(text) => match self.negotiator.channel(&event.peer_id).await {
                Some(channel) => {
                    self.engine
                        .handle_message(&event.peer_id, channel, &text)
                        .await
                }
                None => {
                    tracing::debug!(peer_id = %event.peer_id, "Message without open channel dropped")
                }
            },
            TransportEventKind::ChannelClosed | TransportEventKind::StateChanged(_) => {
                self.engine.fail_peer(&event.peer_id, CHANNEL_CLOSED);
            }
            _ => {}
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Returns the other live sessions.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.peers.subscribe()
    }

    /// Returns our session id once the server assigned one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.borrow().clone()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Option<String>> {
        self.session_id.subscribe()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.engine.transfers()
    }

    pub fn subscribe_transfers(&self) -> watch::Receiver<Vec<Transfer>> {
        self.engine.subscribe()
    }

    /// The transfer engine, for pause/resume/cancel/accept/reject/save/clear.
    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Finds a peer by session id, or else by display name.
    pub fn find_peer(&self, query: &str) -> Option<PeerInfo> {
        let peers = self.peers.borrow();
        peers
            .iter()
            .find(|p| p.id == query)
            .or_else(|| peers.iter().find(|p| p.name == query))
            .cloned()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Connects to `peer_id` (reusing an open channel) and offers each file.
    ///
    /// Returns the new transfer ids in the order of `files`.
    pub async fn send_files(
        &self,
        peer_id: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Vec<String>, ClientError> {
        if !self.peers.borrow().iter().any(|p| p.id == peer_id) {
            return Err(ClientError::UnknownPeer(peer_id.to_string()));
        }

        self.negotiator.initiate(peer_id).await?;
        let channel = self.negotiator.wait_for_channel(peer_id).await?;

        Ok(files
            .into_iter()
            .map(|file| self.engine.send_file(peer_id, channel.clone(), file))
            .collect())
    }

    /// Re-offers the source of a failed outgoing transfer under a new id.
    pub async fn retry(&self, id: &str) -> Result<String, ClientError> {
        let transfer = self
            .engine
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if transfer.status != TransferStatus::Error {
            return Err(TransferError::InvalidState {
                action: "retry",
                status: transfer.status,
            }
            .into());
        }
        let (peer_id, file) = self.engine.source_of(id).ok_or(TransferError::InvalidState {
            action: "retry",
            status: transfer.status,
        })?;

        tracing::info!(file_id = %id, peer_id = %peer_id, "Retrying transfer");
        let mut ids = self.send_files(&peer_id, vec![file]).await?;
        ids.pop()
            .ok_or_else(|| TransferError::NotFound(id.to_string()).into())
    }

    /// Changes our display name.
    pub async fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.signaling.set_name(name).await?;
        Ok(())
    }

    /// Closes every connection and leaves the signaling server.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.negotiator.close_all().await;
        self.signaling.disconnect().await;
        tracing::info!("Peer client stopped");
    }
}
