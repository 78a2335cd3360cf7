//! Node configuration
//!
//! A node is configured from a JSON file. Every field has a default, so an
//! empty object is a valid configuration. [`NodeConfig::validate`] checks the
//! host before anything starts: both ports must be free and the state
//! directory must exist (it is created if missing) and be writable.

use conclave_consensus::{Address, ConsensusConfig, ConsensusConfigBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Port {port} is not available: {source}")]
    PortUnavailable { port: u16, source: std::io::Error },

    #[error("Unable to prepare state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("State directory {0} is not writable")]
    NotWritable(PathBuf),

    #[error("Invalid seed address: {0}")]
    InvalidSeed(String),

    #[error("Invalid timings: {0}")]
    InvalidTimings(&'static str),
}

/// Configuration of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// Host other members use to reach this node
    pub host: String,

    /// Port for peer connections
    pub gateway_port: u16,

    /// Port reserved for the client API
    pub api_port: u16,

    /// Directory for snapshots and other local state
    pub state_dir: PathBuf,

    /// Addresses (`host:port`) to contact while looking for a cluster
    pub seeds: Vec<String>,

    /// Smallest cluster, this node included, that may become quorate
    pub min_cluster_size: usize,

    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,

    /// Restarts allowed per supervised unit before it is given up on
    pub max_restarts: u32,

    /// Delay before restarting a failed unit
    pub restart_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            gateway_port: 7000,
            api_port: 8000,
            state_dir: PathBuf::from("state"),
            seeds: Vec::new(),
            min_cluster_size: 3,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_restarts: 5,
            restart_backoff_ms: 500,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        info!(path = %path.display(), ?config, "Loaded configuration");
        Ok(config)
    }

    /// Check ports, state directory and seeds
    pub fn validate(&self) -> Result<()> {
        check_port(self.gateway_port)?;
        check_port(self.api_port)?;
        check_state_dir(&self.state_dir)?;
        self.check_timings()?;
        self.seed_addresses()?;

        info!("Configuration validated");
        Ok(())
    }

    /// Address advertised to other members
    pub fn advertise_address(&self) -> Address {
        Address::new(self.host.clone(), self.gateway_port)
    }

    /// Address the transport listens on
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.gateway_port))
    }

    pub fn seed_addresses(&self) -> Result<Vec<Address>> {
        self.seeds
            .iter()
            .map(|seed| {
                seed.parse::<Address>()
                    .map_err(|_| ConfigError::InvalidSeed(seed.clone()))
            })
            .collect()
    }

    fn check_timings(&self) -> Result<()> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::InvalidTimings(
                "election timeout minimum must be below its maximum",
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::InvalidTimings(
                "heartbeat interval must be below the election timeout",
            ));
        }
        if self.min_cluster_size == 0 {
            return Err(ConfigError::InvalidTimings("minimum cluster size must be positive"));
        }
        Ok(())
    }

    /// Settings for the consensus core
    pub fn consensus_config(&self) -> Result<ConsensusConfig> {
        self.check_timings()?;
        Ok(ConsensusConfigBuilder::new()
            .election_timeout(
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            )
            .heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .min_cluster_size(self.min_cluster_size)
            .seeds(self.seed_addresses()?)
            .build())
    }
}

fn check_port(port: u16) -> Result<()> {
    info!(port, "Checking port");
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .map(drop)
        .map_err(|source| ConfigError::PortUnavailable { port, source })
}

fn check_state_dir(path: &Path) -> Result<()> {
    info!(path = %path.display(), "Checking state directory");
    if !path.exists() {
        fs::create_dir_all(path).map_err(|source| ConfigError::StateDir {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Created state directory");
    }

    let probe = path.join(".write-probe");
    fs::write(&probe, b"")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|_| ConfigError::NotWritable(path.to_path_buf()))
}
