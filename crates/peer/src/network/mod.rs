//! Network layer for peer connections.
//!
//! This module provides:
//! - The signaling client (WebSocket to the rendezvous server)
//! - Transport traits used by the negotiator
//! - The WebRTC implementation of those traits
//! - Fragmentation of messages too long for one SCTP message

pub mod framing;
pub mod signaling;
pub mod webrtc;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::error::Result;
use protocol::{IceCandidate, RelayKind, SessionDescription};
use serde_json::Value;
use tokio::sync::mpsc;

/// Label of the data channel carrying control messages and chunks.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Offer/answer state of a transport, mirroring the WebRTC signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No description exchange in progress.
    Stable,
    /// A local offer is outstanding.
    HaveLocalOffer,
    /// A remote offer was applied and awaits an answer.
    HaveRemoteOffer,
    /// The transport was closed.
    Closed,
}

/// Connectivity state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Returns true if the transport cannot recover from this state.
    pub fn is_dead(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Something that happened on a transport.
pub enum TransportEventKind {
    /// A local ICE candidate to relay to the peer.
    LocalCandidate(IceCandidate),
    /// The peer opened a data channel towards us.
    IncomingChannel(Arc<dyn DataChannel>),
    /// The data channel became open.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// A text message arrived on the data channel.
    Message(String),
    /// The connectivity state changed.
    StateChanged(LinkState),
}

impl std::fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEventKind::LocalCandidate(c) => {
                f.debug_tuple("LocalCandidate").field(c).finish()
            }
            TransportEventKind::IncomingChannel(_) => f.write_str("IncomingChannel"),
            TransportEventKind::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEventKind::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEventKind::Message(text) => {
                f.debug_tuple("Message").field(&text.len()).finish()
            }
            TransportEventKind::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// A transport event tagged with its origin.
///
/// `epoch` identifies the transport instance; events from a transport that
/// has since been replaced are discarded by the negotiator.
#[derive(Debug)]
pub struct TransportEvent {
    pub peer_id: String,
    pub epoch: u64,
    pub kind: TransportEventKind,
}

/// Sender half used by transports to report events.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// An ordered, reliable message channel to one peer.
pub trait DataChannel: Send + Sync {
    /// Returns whether the channel is open for sending.
    fn is_open(&self) -> bool;

    /// Sends one text message.
    fn send_text<'a>(
        &'a self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Closes the channel.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// A negotiated connection to one peer.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description.
pub trait PeerTransport: Send + Sync {
    /// Current offer/answer state.
    fn signaling_state(&self) -> SignalingState;

    fn create_offer<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SessionDescription>> + Send + 'a>>;

    fn create_answer<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<SessionDescription>> + Send + 'a>>;

    fn set_remote_description<'a>(
        &'a self,
        desc: SessionDescription,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: IceCandidate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Opens an outbound ordered data channel.
    fn create_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn DataChannel>>> + Send + 'a>>;

    /// Closes the transport.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Builds transports for the negotiator.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport for `peer_id` reporting events on `events`.
    fn create<'a>(
        &'a self,
        peer_id: &'a str,
        epoch: u64,
        events: TransportEventSender,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerTransport>>> + Send + 'a>>;
}

/// Outbound half of the signaling connection, as used by the negotiator.
pub trait SignalingSink: Send + Sync {
    /// Relays a negotiation payload to `peer_id` through the server.
    fn relay<'a>(
        &'a self,
        kind: RelayKind,
        payload: Value,
        peer_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

pub use self::signaling::{
    ConnectionState as SignalingConnectionState, SignalingConfig, SignalingEvent,
    WebSocketSignalingClient,
};
pub use self::webrtc::{IceServer, WebRtcConfig, WebRtcTransportFactory};
