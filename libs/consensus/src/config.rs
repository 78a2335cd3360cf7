//! Consensus core configuration

use crate::types::Address;
use std::time::Duration;

/// What a connection does when the core's inbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Reject the message; the transport drops the connection
    #[default]
    DropConnection,
    /// Stall the connection until the core catches up
    Wait,
}

/// Configuration for a consensus node
///
/// Built through [`ConsensusConfigBuilder`], which rejects inconsistent
/// settings; fields are read through accessors.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Minimum election timeout
    ///
    /// The actual timeout is randomized between min and max to avoid split votes.
    pub(crate) election_timeout_min: Duration,

    /// Maximum election timeout
    pub(crate) election_timeout_max: Duration,

    /// Heartbeat interval (how often a leader sends AppendEntries)
    pub(crate) heartbeat_interval: Duration,

    /// Capacity of the shared peer → core queue
    pub(crate) inbound_capacity: usize,

    /// Capacity of each gateway's core → peer queue
    pub(crate) outbound_capacity: usize,

    /// Behavior of a connection when the inbound queue is full
    pub(crate) overflow: OverflowPolicy,

    /// Smallest cluster (self included) that may ever be quorate
    ///
    /// 3 keeps two freshly connected nodes from electing each other; set to
    /// 2 to allow two-node clusters, 1 for a single-node cluster.
    pub(crate) min_cluster_size: usize,

    /// Addresses dialed while looking for a cluster
    pub(crate) seeds: Vec<Address>,

    /// Seed for the election timeout RNG; `None` seeds from entropy
    pub(crate) election_seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            // Election timeout between 150-300ms (Raft paper recommendation)
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),

            heartbeat_interval: Duration::from_millis(50),

            inbound_capacity: 100,
            outbound_capacity: 100,
            overflow: OverflowPolicy::DropConnection,

            min_cluster_size: 3,
            seeds: Vec::new(),
            election_seed: None,
        }
    }
}

impl ConsensusConfig {
    pub fn election_timeout_min(&self) -> Duration {
        self.election_timeout_min
    }

    pub fn election_timeout_max(&self) -> Duration {
        self.election_timeout_max
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn inbound_capacity(&self) -> usize {
        self.inbound_capacity
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn min_cluster_size(&self) -> usize {
        self.min_cluster_size
    }

    pub fn seeds(&self) -> &[Address] {
        &self.seeds
    }

    pub fn election_seed(&self) -> Option<u64> {
        self.election_seed
    }
}

/// Builder for ConsensusConfig
pub struct ConsensusConfigBuilder {
    config: ConsensusConfig,
}

impl ConsensusConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsensusConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.config.outbound_capacity = capacity;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.config.overflow = policy;
        self
    }

    pub fn min_cluster_size(mut self, size: usize) -> Self {
        self.config.min_cluster_size = size;
        self
    }

    pub fn seeds(mut self, seeds: Vec<Address>) -> Self {
        self.config.seeds = seeds;
        self
    }

    pub fn election_seed(mut self, seed: u64) -> Self {
        self.config.election_seed = Some(seed);
        self
    }

    pub fn build(self) -> ConsensusConfig {
        assert!(
            self.config.election_timeout_min < self.config.election_timeout_max,
            "election_timeout_min must be less than election_timeout_max"
        );
        assert!(
            self.config.heartbeat_interval < self.config.election_timeout_min,
            "heartbeat_interval must be less than election_timeout_min"
        );
        assert!(
            self.config.inbound_capacity > 0 && self.config.outbound_capacity > 0,
            "queue capacities must be greater than 0"
        );
        assert!(
            self.config.min_cluster_size > 0,
            "min_cluster_size must be greater than 0"
        );

        self.config
    }
}

impl Default for ConsensusConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
