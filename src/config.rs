//! YAML configuration. Every field has a default, so a partial file only
//! overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "quotient.config.yaml";

const DEFAULT_LOG_SIZE: u32 = 22;
const DEFAULT_SERVER_PORT: u16 = 8080;
const DEFAULT_API_KEY: &str = "xyz";
const DEFAULT_LOG_DIR: &str = "/quotient/raft/logs";
const DEFAULT_SNAPSHOT_DIR: &str = "/quotient/raft/snapshots";
const DEFAULT_HEARTBEAT_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not open config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quotient: QuotientSettings,
    pub server: ServerSettings,
    pub raft: RaftSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotientSettings {
    /// Quotient width `q`; the filter holds `2^q` fingerprints.
    #[serde(rename = "logSize")]
    pub log_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub concurrency: usize,
    /// Accepted for config compatibility; requests are not authenticated.
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub node_id: u64,
    /// Address this node binds for peer-to-peer raft traffic.
    pub tcp_address: String,
    /// Heartbeat timeout; elections fire at twice this.
    pub timeout_ms: u64,
    pub log_dir: String,
    pub snapshot_dir: String,
    /// Full cluster routing table, this node included.
    pub peer_addresses: Vec<PeerAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: u64,
    pub raft_addr: String,
    pub http_addr: String,
}

impl Default for QuotientSettings {
    fn default() -> Self {
        Self {
            log_size: DEFAULT_LOG_SIZE,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            api_key: DEFAULT_API_KEY.to_string(),
        }
    }
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            node_id: 1,
            tcp_address: "127.0.0.1:7001".to_string(),
            timeout_ms: DEFAULT_HEARTBEAT_MS,
            log_dir: DEFAULT_LOG_DIR.to_string(),
            snapshot_dir: DEFAULT_SNAPSHOT_DIR.to_string(),
            peer_addresses: Vec::new(),
        }
    }
}

impl RaftSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        2 * self.heartbeat_timeout()
    }
}

impl Config {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.raft.node_id == 0 {
            return Err(ConfigError::Invalid("raft.node_id must be nonzero".into()));
        }
        if self.raft.timeout_ms == 0 {
            return Err(ConfigError::Invalid("raft.timeout must be nonzero".into()));
        }
        if self
            .raft
            .peer_addresses
            .iter()
            .any(|p| p.id == 0)
        {
            return Err(ConfigError::Invalid("peer ids must be nonzero".into()));
        }
        Ok(())
    }
}
