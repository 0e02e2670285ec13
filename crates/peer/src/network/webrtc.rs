//! WebRTC implementation of the transport traits.
//!
//! Each transport wraps one `RTCPeerConnection`. Callbacks registered on the
//! connection and its data channel are forwarded to the negotiator as
//! [`TransportEvent`]s tagged with the peer id and transport epoch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use protocol::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::framing::{fragment, needs_fragmenting, Reassembler};
use super::{
    DataChannel, LinkState, PeerTransport, SignalingState, TransportEvent, TransportEventKind,
    TransportEventSender, TransportFactory,
};
use crate::config::IceServerConfig;

/// A STUN or TURN endpoint handed to the ICE agent.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    /// TURN only.
    pub username: Option<String>,
    /// TURN only.
    pub credential: Option<String>,
}

impl IceServer {
    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<&IceServerConfig> for IceServer {
    fn from(config: &IceServerConfig) -> Self {
        Self {
            urls: config.urls.clone(),
            username: config.username.clone(),
            credential: config.credential.clone(),
        }
    }
}

/// Settings shared by every peer connection the factory creates.
///
/// With no ICE servers only host candidates are gathered, so both peers
/// must be on the same network.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl WebRtcConfig {
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(IceServer::to_rtc).collect(),
            ..Default::default()
        }
    }
}

fn negotiation_error(context: &str, e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::NegotiationFailed(format!("{}: {}", context, e))
}

fn send_failed(e: webrtc::Error) -> ProtocolError {
    ProtocolError::ConnectionClosed(format!("data channel send failed: {}", e))
}

/// Creates `RTCPeerConnection`-backed transports.
pub struct WebRtcTransportFactory {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    /// Builds the WebRTC API used for all transports.
    pub fn new(config: WebRtcConfig) -> Result<Self> {
        // Required even for data-only connections
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| negotiation_error("failed to register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| negotiation_error("failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create<'a>(
        &'a self,
        peer_id: &'a str,
        epoch: u64,
        events: TransportEventSender,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerTransport>>> + Send + 'a>> {
        Box::pin(async move {
            let peer_connection = self
                .api
                .new_peer_connection(self.config.rtc_configuration())
                .await
                .map_err(|e| negotiation_error("failed to create peer connection", e))?;

            let transport = WebRtcTransport {
                peer_connection: Arc::new(peer_connection),
                emitter: Emitter {
                    peer_id: peer_id.to_string(),
                    epoch,
                    events,
                },
            };
            transport.register_handlers();

            Ok(Arc::new(transport) as Arc<dyn PeerTransport>)
        })
    }
}

/// Tags and forwards transport events.
#[derive(Clone)]
struct Emitter {
    peer_id: String,
    epoch: u64,
    events: TransportEventSender,
}

impl Emitter {
    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            peer_id: self.peer_id.clone(),
            epoch: self.epoch,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(peer_id = %self.peer_id, "Transport event receiver dropped");
        }
    }
}

/// One WebRTC peer connection.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    emitter: Emitter,
}

impl WebRtcTransport {
    fn register_handlers(&self) {
        let emitter = self.emitter.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => emitter.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let emitter = self.emitter.clone();
        self.peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    tracing::debug!(peer_id = %emitter.peer_id, "Peer connection state changed: {:?}", state);
                    let state = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                            LinkState::New
                        }
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                    };
                    emitter.emit(TransportEventKind::StateChanged(state));
                })
            },
        ));

        let emitter = self.emitter.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let emitter = emitter.clone();
                Box::pin(async move {
                    tracing::debug!(peer_id = %emitter.peer_id, "Incoming data channel '{}'", channel.label());
                    let channel = WebRtcDataChannel::attach(channel, emitter.clone());
                    let already_open = channel.is_open();
                    emitter.emit(TransportEventKind::IncomingChannel(Arc::new(channel)));
                    if already_open {
                        emitter.emit(TransportEventKind::ChannelOpen);
                    }
                })
            }));
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| negotiation_error("invalid session description", e))
}

impl PeerTransport for WebRtcTransport {
    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn create_offer<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SessionDescription>> + Send + 'a>> {
        Box::pin(async move {
            let offer = self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| negotiation_error("failed to create offer", e))?;

            self.peer_connection
                .set_local_description(offer.clone())
                .await
                .map_err(|e| negotiation_error("failed to set local description", e))?;

            Ok(SessionDescription::offer(offer.sdp))
        })
    }

    fn create_answer<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SessionDescription>> + Send + 'a>> {
        Box::pin(async move {
            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| negotiation_error("failed to create answer", e))?;

            self.peer_connection
                .set_local_description(answer.clone())
                .await
                .map_err(|e| negotiation_error("failed to set local description", e))?;

            Ok(SessionDescription::answer(answer.sdp))
        })
    }

    fn set_remote_description<'a>(
        &'a self,
        desc: SessionDescription,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;
            self.peer_connection
                .set_remote_description(desc)
                .await
                .map_err(|e| negotiation_error("failed to set remote description", e))
        })
    }

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: IceCandidate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            };
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| negotiation_error("failed to add ICE candidate", e))
        })
    }

    fn create_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn DataChannel>>> + Send + 'a>> {
        Box::pin(async move {
            let options = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = self
                .peer_connection
                .create_data_channel(label, Some(options))
                .await
                .map_err(|e| negotiation_error("failed to create data channel", e))?;

            let channel = WebRtcDataChannel::attach(channel, self.emitter.clone());
            Ok(Arc::new(channel) as Arc<dyn DataChannel>)
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.peer_connection.close().await.map_err(|e| {
                ProtocolError::ConnectionClosed(format!("failed to close connection: {}", e))
            })
        })
    }
}

/// A data channel forwarding its events through an [`Emitter`].
///
/// Text longer than one SCTP message is sent as binary fragments, see
/// [`super::framing`].
pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
    // Keeps the fragments of one message contiguous
    fragment_lock: tokio::sync::Mutex<()>,
}

impl WebRtcDataChannel {
    fn attach(channel: Arc<RTCDataChannel>, emitter: Emitter) -> Self {
        let on_open = emitter.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(peer_id = %on_open.peer_id, "Data channel open");
                on_open.emit(TransportEventKind::ChannelOpen);
            })
        }));

        let on_close = emitter.clone();
        channel.on_close(Box::new(move || {
            let on_close = on_close.clone();
            Box::pin(async move {
                tracing::debug!(peer_id = %on_close.peer_id, "Data channel closed");
                on_close.emit(TransportEventKind::ChannelClosed);
            })
        }));

        let on_message = emitter;
        let mut reassembler = Reassembler::default();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let payload = if msg.is_string {
                Some(msg.data.to_vec())
            } else {
                reassembler.ingest(&msg.data).unwrap_or_else(|e| {
                    tracing::warn!(peer_id = %on_message.peer_id, "Dropping fragment: {}", e);
                    None
                })
            };
            let on_message = on_message.clone();
            Box::pin(async move {
                let Some(payload) = payload else { return };
                match String::from_utf8(payload) {
                    Ok(text) => on_message.emit(TransportEventKind::Message(text)),
                    Err(e) => tracing::warn!("Invalid UTF-8 on data channel: {}", e),
                }
            })
        }));

        Self {
            channel,
            fragment_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl DataChannel for WebRtcDataChannel {
    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    fn send_text<'a>(
        &'a self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !needs_fragmenting(&text) {
                return self
                    .channel
                    .send_text(text)
                    .await
                    .map(|_| ())
                    .map_err(send_failed);
            }

            let frames = fragment(text.as_bytes())?;
            let _guard = self.fragment_lock.lock().await;
            for frame in &frames {
                self.channel.send(frame).await.map_err(send_failed)?;
            }
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.channel.close().await.map_err(|e| {
                ProtocolError::ConnectionClosed(format!("failed to close data channel: {}", e))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::DATA_CHANNEL_LABEL;
    use protocol::{ChunkCodec, ControlMessage, DEFAULT_CHUNK_SIZE};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Relays local candidates to `remote` and collects received messages.
    async fn pump_events(
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        remote: Arc<dyn PeerTransport>,
        messages: mpsc::UnboundedSender<String>,
    ) {
        while let Some(event) = events.recv().await {
            match event.kind {
                TransportEventKind::LocalCandidate(candidate) => {
                    let _ = remote.add_ice_candidate(candidate).await;
                }
                TransportEventKind::Message(text) => {
                    let _ = messages.send(text);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_webrtc_config_default_is_lan_only() {
        let config = WebRtcConfig::default();
        assert!(config.ice_servers.is_empty());
        assert!(config.rtc_configuration().ice_servers.is_empty());
    }

    #[test]
    fn test_ice_server_turn() {
        let server = IceServer::from(&IceServerConfig {
            urls: vec!["turn:example.com:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("pass".to_string()),
        });
        let rtc = server.to_rtc();
        assert_eq!(rtc.urls, vec!["turn:example.com:3478"]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "pass");
    }

    #[test]
    fn test_ice_server_from_config() {
        let config = IceServerConfig {
            urls: vec!["stun:stun.example.com:3478".to_string()],
            username: None,
            credential: None,
        };
        let server = IceServer::from(&config);
        assert_eq!(server.urls, config.urls);
        assert!(server.username.is_none());
    }

    #[tokio::test]
    async fn test_create_transport_and_offer() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let transport = factory.create("bbb", 1, tx).await.unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::Stable);

        let channel = transport.create_data_channel("file-transfer").await.unwrap();
        assert!(!channel.is_open());

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let offerer = factory.create("bbb", 1, tx.clone()).await.unwrap();
        let answerer = factory.create("aaa", 2, tx).await.unwrap();

        offerer.create_data_channel("file-transfer").await.unwrap();
        let offer = offerer.create_offer().await.unwrap();

        answerer.set_remote_description(offer).await.unwrap();
        assert_eq!(answerer.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);

        offerer.set_remote_description(answer).await.unwrap();
        assert_eq!(offerer.signaling_state(), SignalingState::Stable);

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_size_chunk_crosses_real_channel() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig::default()).unwrap();
        let (offerer_tx, offerer_rx) = mpsc::unbounded_channel();
        let (answerer_tx, answerer_rx) = mpsc::unbounded_channel();

        let offerer = factory.create("bbb", 1, offerer_tx).await.unwrap();
        let answerer = factory.create("aaa", 1, answerer_tx).await.unwrap();

        let channel = offerer.create_data_channel(DATA_CHANNEL_LABEL).await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let (offerer_msgs, _offerer_inbox) = mpsc::unbounded_channel();
        let (answerer_msgs, mut answerer_inbox) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(offerer_rx, answerer.clone(), offerer_msgs));
        tokio::spawn(pump_events(answerer_rx, offerer.clone(), answerer_msgs));

        tokio::time::timeout(Duration::from_secs(15), async {
            while !channel.is_open() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("data channel did not open");

        let data: Vec<u8> = (0..DEFAULT_CHUNK_SIZE as usize)
            .map(|i| 100 + (i % 156) as u8)
            .collect();
        let chunk = ChunkCodec::new(false).encode("f1", 0, 1, &data).unwrap();
        let text = ControlMessage::FileChunk(chunk).to_json().unwrap();
        assert!(text.len() > u16::MAX as usize);

        channel.send_text("{\"hello\":1}".to_string()).await.unwrap();
        channel.send_text(text.clone()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(10), answerer_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "{\"hello\":1}");

        let received = tokio::time::timeout(Duration::from_secs(10), answerer_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), text.len());
        let ControlMessage::FileChunk(chunk) = ControlMessage::from_json(&received).unwrap() else {
            panic!("expected a file-chunk");
        };
        assert_eq!(ChunkCodec::new(false).decode(&chunk).unwrap(), data);
        assert!(channel.is_open());

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }
}
