//! # Dropwire Protocol Library
//!
//! Wire definitions and chunk cryptography shared by the signaling server
//! and the peer client.
//!
//! ## Overview
//!
//! - **Signaling Messages**: session identity, peer lists and the
//!   offer/answer/candidate relay envelopes
//! - **Control Messages**: file offers, encrypted chunks, acknowledgments
//!   and pause/resume/cancel over the direct data channel
//! - **Chunk Codec**: slicing arithmetic with optional LZ4 compression
//! - **Chunk Crypto**: AES-256-GCM with a fresh key and nonce per chunk
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Control Messages (JSON)          │  file-offer / file-chunk / acks
//! ├─────────────────────────────────────────┤
//! │        Per-chunk AES-256-GCM            │  fresh key + nonce per chunk
//! ├─────────────────────────────────────────┤
//! │        Optional LZ4 compression         │  useCompression
//! ├─────────────────────────────────────────┤
//! │        WebRTC data channel (ordered)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{chunk_count, ChunkCodec, ControlMessage, DEFAULT_CHUNK_SIZE};
//!
//! let data = vec![0u8; 150_000];
//! let total = chunk_count(data.len() as u64, DEFAULT_CHUNK_SIZE);
//! assert_eq!(total, 3);
//!
//! let codec = ChunkCodec::new(false);
//! let chunk = codec.encode("file-1", 0, total, &data[..65_536]).unwrap();
//! let text = ControlMessage::FileChunk(chunk).to_json().unwrap();
//!
//! if let ControlMessage::FileChunk(received) = ControlMessage::from_json(&text).unwrap() {
//!     assert_eq!(codec.decode(&received).unwrap().len(), 65_536);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`signaling`]: Server/peer signaling messages
//! - [`messages`]: Data-channel control messages
//! - [`chunking`]: Chunk arithmetic and codec
//! - [`crypto`]: Per-chunk AEAD
//! - [`error`]: Error types

pub mod chunking;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod signaling;

pub use chunking::{
    bytes_through, chunk_count, chunk_range, ChunkCodec, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};
pub use crypto::{open_chunk, seal_chunk, ChunkKey, KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};
pub use error::{ProtocolError, Result};
pub use messages::{
    ChunkAck, ControlAction, ControlMessage, EncryptionDetails, FileChunk, FileOffer,
    FileOfferAck, TransferControl,
};
pub use signaling::{
    ClientMessage, IceCandidate, PeerInfo, RelayKind, SdpType, ServerMessage, SessionDescription,
};
