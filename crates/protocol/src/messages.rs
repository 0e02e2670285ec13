//! Control messages exchanged over the direct peer data channel.
//!
//! All messages are JSON text tagged by `type`. Byte payloads are encoded
//! as JSON arrays of numbers so that browser peers can read them with
//! `Uint8Array.from(...)`.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level data-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Announces a file the sender wants to transmit.
    FileOffer(FileOffer),
    /// Receiver is ready for the chunks of an offered file.
    FileOfferAck(FileOfferAck),
    /// One encrypted chunk of a file.
    FileChunk(FileChunk),
    /// Receiver processed one chunk.
    ChunkAck(ChunkAck),
    /// Pause, resume or cancel a transfer.
    TransferControl(TransferControl),
}

impl ControlMessage {
    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the transfer identifier this message refers to.
    pub fn file_id(&self) -> &str {
        match self {
            ControlMessage::FileOffer(m) => &m.file_id,
            ControlMessage::FileOfferAck(m) => &m.file_id,
            ControlMessage::FileChunk(m) => &m.file_id,
            ControlMessage::ChunkAck(m) => &m.file_id,
            ControlMessage::TransferControl(m) => &m.file_id,
        }
    }
}

/// Announces a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOffer {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    /// Chunk payloads are LZ4-compressed before encryption.
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOfferAck {
    pub file_id: String,
}

/// Key and nonce needed to open one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionDetails {
    /// 256-bit AES-GCM key.
    pub key: Vec<u8>,
    /// 96-bit nonce.
    pub iv: Vec<u8>,
}

/// One encrypted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Ciphertext including the authentication tag.
    pub chunk: Vec<u8>,
    pub encryption_details: EncryptionDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub file_id: String,
    pub chunk_index: u32,
}

/// Requested state change for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferControl {
    pub file_id: String,
    pub action: ControlAction,
}
