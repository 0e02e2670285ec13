//! # Dropwire Peer
//!
//! Client side of Dropwire: joins the signaling server, negotiates direct
//! WebRTC data channels with other peers and streams encrypted files over
//! them.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`network`]: Signaling client, transport traits and the WebRTC adapter
//! - [`negotiator`]: Per-peer offer/answer/candidate state and glare handling
//! - [`transfer`]: Transfer records, the chunk streaming engine and file storage
//! - [`client`]: Event loop tying the pieces together
//! - [`error`]: Error types

pub mod client;
pub mod config;
pub mod error;
pub mod negotiator;
pub mod network;
pub mod transfer;

pub use client::PeerClient;
pub use config::{Config, ConfigError};
pub use error::{ClientError, NegotiationError, TransferError};
pub use negotiator::{NegotiationState, Negotiator, NegotiatorConfig};
pub use transfer::{
    EngineSettings, OutgoingFile, Transfer, TransferDirection, TransferEngine, TransferStatus,
};
