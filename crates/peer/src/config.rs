//! Configuration management for the Dropwire peer.
//!
//! Settings live in `~/.config/dropwire/peer.toml`. Missing keys take their
//! defaults, and a few `DROPWIRE_*` environment variables override the file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Default signaling server URL.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001";

/// A value that passed TOML parsing but is out of range.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("signaling_url must be a ws:// or wss:// URL, got {0}")]
    InvalidSignalingUrl(String),

    #[error("ice server entry {0} has no urls")]
    EmptyIceServer(usize),

    #[error("chunk_size must be between 1024 and 1048576, got {0}")]
    InvalidChunkSize(u32),

    #[error("ack_window must be between 1 and 64, got {0}")]
    InvalidAckWindow(u32),

    #[error("{field} must be at least 1, got 0")]
    ZeroValue { field: &'static str },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,

    /// Signaling and WebRTC settings.
    pub network: NetworkConfig,

    /// Transfer engine settings.
    pub transfer: TransferConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name shown to other peers. The server default applies when unset.
    pub display_name: Option<String>,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// A STUN or TURN server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Signaling and WebRTC settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket URL of the signaling server.
    pub signaling_url: String,

    /// ICE servers. Empty means host candidates only (same LAN).
    pub ice_servers: Vec<IceServerConfig>,

    /// Poll interval while waiting for a data channel to open.
    pub channel_wait_interval_ms: u64,

    /// Number of polls before giving up on a data channel.
    pub channel_wait_attempts: u32,
}

/// Transfer engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per chunk.
    pub chunk_size: u32,

    /// Maximum number of unacknowledged chunks in flight.
    pub ack_window: u32,

    /// Seconds to wait for a chunk acknowledgment.
    pub ack_timeout_secs: u64,

    /// Seconds to wait for the receiver to acknowledge an offer.
    pub offer_ack_timeout_secs: u64,

    /// LZ4-compress chunks before encryption.
    pub use_compression: bool,

    /// Acknowledge incoming offers without waiting for `accept`.
    pub auto_accept: bool,

    /// Where received files are saved. Defaults to the user's download dir.
    pub download_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: Vec::new(),
            channel_wait_interval_ms: 100,
            channel_wait_attempts: 100,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_window: 4,
            ack_timeout_secs: 15,
            offer_ack_timeout_secs: 60,
            use_compression: false,
            auto_accept: true,
            download_dir: None,
        }
    }
}

impl NetworkConfig {
    /// Poll interval as a `Duration`.
    pub fn channel_wait_interval(&self) -> Duration {
        Duration::from_millis(self.channel_wait_interval_ms)
    }
}

impl TransferConfig {
    /// Chunk acknowledgment timeout as a `Duration`.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Offer acknowledgment timeout as a `Duration`.
    pub fn offer_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_ack_timeout_secs)
    }

    /// Resolved download directory.
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// `<config dir>/dropwire/peer.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dropwire")
        .join("peer.toml")
}

impl Config {
    /// Applies `DROPWIRE_SIGNALING_URL`, `DROPWIRE_NAME` and
    /// `DROPWIRE_LOG_LEVEL` when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DROPWIRE_SIGNALING_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding signaling_url from environment: {}", url);
                self.network.signaling_url = url;
            }
        }

        if let Ok(name) = std::env::var("DROPWIRE_NAME") {
            if !name.trim().is_empty() {
                tracing::info!("Overriding display_name from environment: {}", name);
                self.general.display_name = Some(name);
            }
        }

        if let Ok(level) = std::env::var("DROPWIRE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }
    }

    /// Checks ranges and formats. Run after all overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match Url::parse(&self.network.signaling_url) {
            Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
            _ => {
                return Err(ConfigError::InvalidSignalingUrl(
                    self.network.signaling_url.clone(),
                ))
            }
        }

        if let Some(index) = self
            .network
            .ice_servers
            .iter()
            .position(|server| server.urls.is_empty())
        {
            return Err(ConfigError::EmptyIceServer(index));
        }

        if self.network.channel_wait_interval_ms == 0 {
            return Err(ConfigError::ZeroValue {
                field: "channel_wait_interval_ms",
            });
        }

        if self.network.channel_wait_attempts == 0 {
            return Err(ConfigError::ZeroValue {
                field: "channel_wait_attempts",
            });
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.transfer.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.transfer.chunk_size));
        }

        if !(1..=64).contains(&self.transfer.ack_window) {
            return Err(ConfigError::InvalidAckWindow(self.transfer.ack_window));
        }

        if self.transfer.ack_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "ack_timeout_secs",
            });
        }

        if self.transfer.offer_ack_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "offer_ack_timeout_secs",
            });
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        Ok(())
    }

    /// Reads `path`, falling back to defaults when the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No peer config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents).with_context(|| format!("Cannot parse {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Writes the configuration as TOML, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let rendered = self.to_toml()?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }

        fs::write(path, rendered).with_context(|| format!("Cannot write {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| anyhow::anyhow!("Invalid peer config: {}", describe(&e)))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Cannot render peer config")
    }
}

/// Error message with the byte range it points at, when known.
fn describe(error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", error.message(), span.start, span.end),
        None => error.message().to_string(),
    }
}
