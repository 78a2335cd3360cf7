//! Cluster membership and leader election core
//!
//! A node is always in exactly one [`Phase`], a valid pairing of [`Role`]
//! and [`State`]. The phase decides which behavior processes events and
//! which [`Capability`] set the node holds. Nodes start DORMANT, wait until
//! enough members are connected to form a quorum, elect a leader and are then
//! inducted by it before serving clients.
//!
//! # Features
//!
//! - Membership gossip piggy-backed on every RPC
//! - Quorum tracking over live peer connections
//! - Leader election with randomized timeouts
//! - Follower induction with snapshot-based bootstrap
//! - Bounded queues with configurable overflow handling
//!
//! # Example
//!
//! ```no_run
//! use conclave_consensus::{channel, start_consensus_module, ConsensusConfig, ConsensusServer, MemorySnapshotStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> conclave_consensus::Result<()> {
//! let config = ConsensusConfig::default();
//! let (handle, mailbox) = channel(&config);
//! let server = ConsensusServer::new(
//!     "10.0.0.1:7000".parse()?,
//!     config,
//!     mailbox,
//!     Arc::new(MemorySnapshotStore::new()),
//! );
//!
//! let shutdown = CancellationToken::new();
//! let (ready, exit) = start_consensus_module(server, shutdown.clone());
//! let _ = ready.await;
//! println!("{:?}", handle.status());
//!
//! shutdown.cancel();
//! let _ = exit.await;
//! # Ok(())
//! # }
//! ```

mod behavior;
mod capability;
mod config;
mod gateway;
mod membership;
mod node;
mod rpc;
mod snapshot;
mod state;
mod types;

pub use capability::{Capability, CapabilitySet};
pub use config::{ConsensusConfig, ConsensusConfigBuilder, OverflowPolicy};
pub use gateway::{Direction, Gateway, GatewayLink, PeerRegistry};
pub use membership::{has_quorum, merge_view, quorum_size, ClusterView, Membership};
pub use node::{channel, start_consensus_module, ConsensusHandle, ConsensusServer, DialRequests, Mailbox};
pub use rpc::{Envelope, Message, Rpc};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotMetadata, SnapshotStore};
pub use state::{CandidateState, LeaderState, NodeStatus, Phase, Role, State};
pub use types::{Address, ConnectionId, LogIndex, Term};

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur in the consensus core
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("No behavior for role {role} in state {state}")]
    InvalidPhase { role: Role, state: State },

    #[error("{capability} not available to {role}/{state}")]
    CapabilityDenied {
        capability: Capability,
        role: Role,
        state: State,
    },

    #[error("Gateway {0} is closed")]
    GatewayClosed(ConnectionId),

    #[error("Queue full on {0}")]
    Backpressure(ConnectionId),

    #[error("Consensus server is shutting down")]
    ShuttingDown,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Snapshot storage error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}
