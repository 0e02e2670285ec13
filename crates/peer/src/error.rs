//! Error types for negotiation and file transfer.

use protocol::ProtocolError;
use thiserror::Error;

use crate::transfer::TransferStatus;

/// Errors raised while negotiating a peer connection.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// No connection entry exists for the peer.
    #[error("no connection for peer {0}")]
    NoTransport(String),

    /// A relayed description or candidate could not be parsed.
    #[error("malformed {kind} from {peer_id}: {reason}")]
    Malformed {
        kind: &'static str,
        peer_id: String,
        reason: String,
    },

    /// The data channel did not open in time.
    #[error("data channel to {peer_id} not open after {attempts} attempts")]
    ChannelTimeout { peer_id: String, attempts: u32 },

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
}

/// Errors raised by the transfer engine.
///
/// The display text of the connectivity-related variants mentions the
/// connection or channel so that [`crate::transfer::Transfer::is_connectivity_error`]
/// can classify the stored message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransferError {
    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("cannot {action} a transfer that is {status}")]
    InvalidState {
        action: &'static str,
        status: TransferStatus,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer cancelled by peer")]
    CancelledByPeer,

    #[error("transfer rejected by peer")]
    RejectedByPeer,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("data channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("timed out waiting for {0} (connection may be lost)")]
    Timeout(String),

    #[error("chunk processing failed: {0}")]
    Chunk(String),

    #[error("file error: {0}")]
    Io(String),

    #[error("transfer is incomplete: {received} of {total} chunks")]
    Incomplete { received: u32, total: u32 },
}

/// Errors returned by [`crate::client::PeerClient`] commands.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed(msg) => TransferError::ConnectionLost(msg),
            ProtocolError::Timeout(msg) => TransferError::Timeout(msg),
            other => TransferError::Chunk(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        assert_eq!(
            TransferError::ConnectionLost("peer disconnected".to_string()).to_string(),
            "connection lost: peer disconnected"
        );
        assert_eq!(
            TransferError::InvalidState {
                action: "pause",
                status: TransferStatus::Completed,
            }
            .to_string(),
            "cannot pause a transfer that is completed"
        );
        assert_eq!(
            TransferError::Incomplete {
                received: 1,
                total: 3
            }
            .to_string(),
            "transfer is incomplete: 1 of 3 chunks"
        );
    }

    #[test]
    fn test_from_protocol_error() {
        let err: TransferError = ProtocolError::ConnectionClosed("gone".to_string()).into();
        assert_eq!(err, TransferError::ConnectionLost("gone".to_string()));

        let err: TransferError = ProtocolError::Decryption("bad tag".to_string()).into();
        assert!(matches!(err, TransferError::Chunk(_)));
    }

    #[test]
    fn test_negotiation_error_display() {
        let err = NegotiationError::ChannelTimeout {
            peer_id: "bbb".to_string(),
            attempts: 100,
        };
        assert_eq!(
            err.to_string(),
            "data channel to bbb not open after 100 attempts"
        );
    }
}
