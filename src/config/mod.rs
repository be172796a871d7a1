//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub recording: RecordingConfig,
}

/// Signaling listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: String,

    /// Only upgrades on this path are accepted
    pub ws_path: String,

    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            ws_path: "/one2onecomposrec".to_string(),
            outbound_queue: 256,
        }
    }
}

/// Media server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Media server JSON-RPC endpoint
    pub ws_uri: String,

    /// Seconds to wait for any single media server request
    pub request_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ws_uri: "ws://localhost:8888/kurento".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl MediaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where and how calls are recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recording URI up to the unique suffix, as seen by the media server
    pub uri_prefix: String,

    /// File extension of recordings
    pub extension: String,

    /// Container profile handed to the recorder
    pub media_profile: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            uri_prefix: "file:///tmp/kurento-one2one-composite".to_string(),
            extension: "mp4".to_string(),
            media_profile: "MP4".to_string(),
        }
    }
}

impl RecordingConfig {
    /// Build the output URI for a recording with the given unique tag
    pub fn uri_for(&self, tag: &str) -> String {
        format!("{}-{}.{}", self.uri_prefix, tag, self.extension)
    }
}

impl Config {
    /// Load config from an explicit path, the default location, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::load_from(&default_path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    /// Load config from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("callrec")
            .join("config.toml")
    }
}
