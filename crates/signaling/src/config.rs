//! Signaling server settings.
//!
//! Read from `~/.config/dropwire/signaling.toml` unless `--config` names
//! another file. Every key is optional.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

const SESSION_LIMITS: RangeInclusive<usize> = 1..=100_000;
const HEARTBEAT_LIMITS: RangeInclusive<u64> = 1..=3600;
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address like 0.0.0.0:3001, got {0}")]
    InvalidBind(String),

    #[error("max_sessions must be between 1 and 100000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("heartbeat_interval_secs must be between 1 and 3600, got {0}")]
    InvalidHeartbeat(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Listener and registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to accept WebSocket connections on.
    pub bind: String,

    /// Registrations beyond this are refused at upgrade time.
    pub max_sessions: usize,

    /// Seconds between server pings to each client.
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,

    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND_ADDR.to_string(),
            max_sessions: 1024,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("dropwire").join("signaling.toml")
}

/// Value of `name` if it is set to something non-empty.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl Config {
    /// Applies `DROPWIRE_BIND` and `DROPWIRE_LOG_LEVEL`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = env_value("DROPWIRE_BIND") {
            tracing::info!(bind = %bind, "bind overridden by DROPWIRE_BIND");
            self.server.bind = bind;
        }
        if let Some(level) = env_value("DROPWIRE_LOG_LEVEL") {
            tracing::info!(level = %level, "log_level overridden by DROPWIRE_LOG_LEVEL");
            self.logging.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBind(server.bind.clone()));
        }
        if !SESSION_LIMITS.contains(&server.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(server.max_sessions));
        }
        if !HEARTBEAT_LIMITS.contains(&server.heartbeat_interval_secs) {
            return Err(ConfigError::InvalidHeartbeat(server.heartbeat_interval_secs));
        }

        let level = self.logging.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }
        Ok(())
    }

    /// Reads `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("Cannot parse {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No signaling config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Cannot read {}", path.display())),
        }
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| {
            let at = e
                .span()
                .map(|span| format!(" (bytes {}..{})", span.start, span.end))
                .unwrap_or_default();
            anyhow::anyhow!("Invalid signaling config: {}{}", e.message(), at)
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Cannot render signaling config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind, DEFAULT_BIND_ADDR);
        assert_eq!(config.server.max_sessions, 1024);
        assert_eq!(config.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.logging.log_level, "info");
        assert!(config.logging.log_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
bind = "127.0.0.1:9000"

[logging]
log_dir = "/var/log/dropwire"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.max_sessions, 1024);
        assert_eq!(
            config.logging.log_dir,
            Some(PathBuf::from("/var/log/dropwire"))
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nbind = 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid signaling config"));
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.server.max_sessions = 12;
        original.logging.log_level = "debug".to_string();

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/signaling.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("signaling.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Cannot parse"));
    }

    #[test]
    fn test_validate_bind() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBind("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.server.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));
    }

    #[test]
    fn test_validate_heartbeat() {
        let mut config = Config::default();
        config.server.heartbeat_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHeartbeat(0)));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.logging.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("dropwire"));
        assert!(path.to_string_lossy().ends_with("signaling.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_bind() {
        std::env::set_var("DROPWIRE_BIND", "127.0.0.1:4000");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.bind, "127.0.0.1:4000");

        std::env::remove_var("DROPWIRE_BIND");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("DROPWIRE_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.log_level, "info");

        std::env::remove_var("DROPWIRE_LOG_LEVEL");
    }
}
