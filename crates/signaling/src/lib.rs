//! # Dropwire Signaling Server
//!
//! Rendezvous service for Dropwire peers. Peers connect over WebSocket,
//! receive a session identity, see every other live session and exchange
//! WebRTC offers, answers and ICE candidates through the relay. File data
//! never passes through this server.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`registry`]: Session identities, names and peer-list broadcasts
//! - [`relay`]: Sender-verified forwarding of negotiation payloads
//! - [`server`]: WebSocket accept loop and per-connection tasks

pub mod config;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::{Config, ConfigError};
pub use registry::{RegistryError, SessionRegistry, SessionSink};
pub use relay::{relay, RelayOutcome};
pub use server::{SessionHandle, SignalingServer};
