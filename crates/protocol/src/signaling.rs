//! Signaling wire messages exchanged between peers and the signaling server.
//!
//! Every frame is a JSON text message tagged by `type` (kebab-case). The
//! negotiation payloads (`offer`, `answer`, `candidate`) are carried as
//! opaque JSON values so the server can forward them without interpreting
//! them; peers convert them to [`SessionDescription`] and [`IceCandidate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A session entry as seen by other peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Server-assigned session identifier.
    pub id: String,
    /// User-settable display name.
    pub name: String,
}

/// Kind of negotiation payload carried through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// Trickled ICE candidate.
    IceCandidate,
}

impl RelayKind {
    /// Returns the wire event name for this kind.
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayKind::Offer => "relay-offer",
            RelayKind::Answer => "relay-answer",
            RelayKind::IceCandidate => "relay-ice-candidate",
        }
    }
}

/// Messages sent from a peer to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Change this session's display name.
    SetName { name: String },
    /// Forward an SDP offer to `peer_id`.
    RelayOffer {
        offer: Value,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Forward an SDP answer to `peer_id`.
    RelayAnswer {
        answer: Value,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Forward an ICE candidate to `peer_id`.
    RelayIceCandidate {
        candidate: Value,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

impl ClientMessage {
    /// Splits a relay request into its kind, payload and destination.
    ///
    /// Returns `None` for non-relay messages.
    pub fn into_relay(self) -> Option<(RelayKind, Value, String)> {
        match self {
            ClientMessage::RelayOffer { offer, peer_id } => {
                Some((RelayKind::Offer, offer, peer_id))
            }
            ClientMessage::RelayAnswer { answer, peer_id } => {
                Some((RelayKind::Answer, answer, peer_id))
            }
            ClientMessage::RelayIceCandidate { candidate, peer_id } => {
                Some((RelayKind::IceCandidate, candidate, peer_id))
            }
            ClientMessage::SetName { .. } => None,
        }
    }

    /// Builds a relay request of the given kind.
    pub fn relay(kind: RelayKind, payload: Value, peer_id: impl Into<String>) -> Self {
        let peer_id = peer_id.into();
        match kind {
            RelayKind::Offer => ClientMessage::RelayOffer {
                offer: payload,
                peer_id,
            },
            RelayKind::Answer => ClientMessage::RelayAnswer {
                answer: payload,
                peer_id,
            },
            RelayKind::IceCandidate => ClientMessage::RelayIceCandidate {
                candidate: payload,
                peer_id,
            },
        }
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent from the signaling server to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identity assigned to this connection.
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Current set of other live sessions.
    PeersUpdated { peers: Vec<PeerInfo> },
    /// SDP offer relayed from `from`.
    RelayOffer { offer: Value, from: String },
    /// SDP answer relayed from `from`.
    RelayAnswer { answer: Value, from: String },
    /// ICE candidate relayed from `from`.
    RelayIceCandidate { candidate: Value, from: String },
}

impl ServerMessage {
    /// Builds a relayed message annotated with the verified sender.
    pub fn relayed(kind: RelayKind, payload: Value, from: impl Into<String>) -> Self {
        let from = from.into();
        match kind {
            RelayKind::Offer => ServerMessage::RelayOffer {
                offer: payload,
                from,
            },
            RelayKind::Answer => ServerMessage::RelayAnswer {
                answer: payload,
                from,
            },
            RelayKind::IceCandidate => ServerMessage::RelayIceCandidate {
                candidate: payload,
                from,
            },
        }
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// An offer.
    Offer,
    /// An answer.
    Answer,
}

/// A session description as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP text.
    pub sdp: String,
}

impl SessionDescription {
    /// Creates an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Converts to an opaque relay payload.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses a relay payload.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line (without the `a=` prefix).
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description.
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Returns true for the empty end-of-candidates marker.
    pub fn is_empty(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Converts to an opaque relay payload.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses a relay payload.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
