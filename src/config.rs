//! Configuration
//!
//! Configuration structures for server and client.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::keystore::DEFAULT_KEY_FILE;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::registry::DEFAULT_HISTORY_CAPACITY;
use crate::session::DEFAULT_OUTBOUND_QUEUE;

/// Default chat port
pub const DEFAULT_PORT: u16 = 5000;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Seconds to wait for the encrypted nickname after accept
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds of silence before an active session is dropped; 0 disables
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Frames a session may have queued before it counts as dead
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_len: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_key_file() -> PathBuf {
    PathBuf::from(DEFAULT_KEY_FILE)
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_QUEUE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            key_file: default_key_file(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_queue_len: DEFAULT_OUTBOUND_QUEUE,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_reconnect_attempts() -> u32 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            key_file: default_key_file(),
            nickname: None,
            connect_timeout_secs: default_connect_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.key_file, PathBuf::from("key.2pk"));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.outbound_queue_len, 256);
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_attempts, 1);
    }

    #[test]
    fn test_partial_server_file() {
        let config: ServerConfig = toml::from_str("port = 6000\nidle_timeout_secs = 0\n").unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_shipped_samples_parse() {
        let server: ServerConfig = toml::from_str(include_str!("../config/server.toml")).unwrap();
        assert_eq!(server.port, DEFAULT_PORT);
        let client: ClientConfig = toml::from_str(include_str!("../config/client.toml")).unwrap();
        assert_eq!(client.nickname, None);
    }

    #[test]
    fn test_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "port = \"nope\"").unwrap();

        assert!(matches!(ClientConfig::from_file(&path), Err(ConfigError::ParseError(_))));
        assert!(matches!(
            ClientConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::IoError(_))
        ));
    }
}
