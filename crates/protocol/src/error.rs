//! Failures shared by the signaling server and the peer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be rendered as JSON.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Inbound text was not a message this side understands.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AES-GCM rejected the ciphertext, usually a tag mismatch.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid key material: expected {expected} bytes, got {got}")]
    InvalidKeyMaterial { expected: usize, got: usize },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("chunk of {len} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { len: usize, max: u32 },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Offer/answer exchange or transport setup failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Any other I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Io => ProtocolError::Encode(err.to_string()),
            _ => ProtocolError::Malformed(err.to_string()),
        }
    }
}

impl From<lz4_flex::block::DecompressError> for ProtocolError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        ProtocolError::Decompression(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let text = err.to_string();
        match err.kind() {
            TimedOut => ProtocolError::Timeout(text),
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                ProtocolError::ConnectionClosed(text)
            }
            _ => ProtocolError::Io(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_key_material_message_names_both_lengths() {
        let err = ProtocolError::InvalidKeyMaterial {
            expected: 32,
            got: 16,
        };
        assert_eq!(
            err.to_string(),
            "invalid key material: expected 32 bytes, got 16"
        );
    }

    #[test]
    fn test_chunk_out_of_range_message() {
        let err = ProtocolError::ChunkOutOfRange { index: 5, total: 3 };
        assert_eq!(err.to_string(), "chunk index 5 out of range for 3 chunks");
    }

    #[test]
    fn test_chunk_too_large_message() {
        let err = ProtocolError::ChunkTooLarge {
            len: 2_000_000,
            max: 1_048_576,
        };
        assert_eq!(
            err.to_string(),
            "chunk of 2000000 bytes exceeds the 1048576 byte limit"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = ProtocolError::Timeout("no chunk-ack within 15s".to_string());
        assert_eq!(err.to_string(), "operation timed out: no chunk-ack within 15s");
    }

    #[test]
    fn test_bad_json_is_malformed() {
        let err: ProtocolError = serde_json::from_str::<u32>("\"seven\"").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err: ProtocolError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_io_kinds_map_to_variants() {
        let cases = [
            (io::ErrorKind::TimedOut, "timeout"),
            (io::ErrorKind::BrokenPipe, "closed"),
            (io::ErrorKind::UnexpectedEof, "closed"),
            (io::ErrorKind::PermissionDenied, "io"),
        ];
        for (kind, expected) in cases {
            let err: ProtocolError = io::Error::new(kind, "boom").into();
            let got = match err {
                ProtocolError::Timeout(_) => "timeout",
                ProtocolError::ConnectionClosed(_) => "closed",
                ProtocolError::Io(_) => "io",
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(got, expected, "{:?}", kind);
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
