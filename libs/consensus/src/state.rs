//! Node roles, states and the phases they combine into

use crate::capability::{Capability, CapabilitySet};
use crate::membership::quorum_size;
use crate::types::{Address, LogIndex, Term};
use crate::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The role a node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Where a node is in joining and serving the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Wants to be part of a quorate cluster
    Dormant,
    /// Quorate, waiting for a leader before its election timer fires
    Timer,
    /// Asked the leader to bootstrap it
    Inductee,
    /// Catching up with the leader
    Bootstrap,
    /// Serving clients
    Operational,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Dormant => write!(f, "DORMANT"),
            State::Timer => write!(f, "TIMER"),
            State::Inductee => write!(f, "INDUCTEE"),
            State::Bootstrap => write!(f, "BOOTSTRAP"),
            State::Operational => write!(f, "OPERATIONAL"),
        }
    }
}

/// A valid (role, state) pair
///
/// Exactly one phase is active at any instant and it alone decides which
/// behavior runs and which capabilities it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    FollowerDormant,
    FollowerTimer,
    FollowerInductee,
    FollowerBootstrap,
    FollowerOperational,
    CandidateTimer,
    LeaderBootstrap,
    LeaderOperational,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::FollowerDormant,
        Phase::FollowerTimer,
        Phase::FollowerInductee,
        Phase::FollowerBootstrap,
        Phase::FollowerOperational,
        Phase::CandidateTimer,
        Phase::LeaderBootstrap,
        Phase::LeaderOperational,
    ];

    /// Resolve a (role, state) pair, rejecting pairs no behavior implements
    pub fn from_pair(role: Role, state: State) -> Result<Phase> {
        match (role, state) {
            (Role::Follower, State::Dormant) => Ok(Phase::FollowerDormant),
            (Role::Follower, State::Timer) => Ok(Phase::FollowerTimer),
            (Role::Follower, State::Inductee) => Ok(Phase::FollowerInductee),
            (Role::Follower, State::Bootstrap) => Ok(Phase::FollowerBootstrap),
            (Role::Follower, State::Operational) => Ok(Phase::FollowerOperational),
            (Role::Candidate, State::Timer) => Ok(Phase::CandidateTimer),
            (Role::Leader, State::Bootstrap) => Ok(Phase::LeaderBootstrap),
            (Role::Leader, State::Operational) => Ok(Phase::LeaderOperational),
            (role, state) => Err(ConsensusError::InvalidPhase { role, state }),
        }
    }

    pub fn role(self) -> Role {
        match self {
            Phase::FollowerDormant
            | Phase::FollowerTimer
            | Phase::FollowerInductee
            | Phase::FollowerBootstrap
            | Phase::FollowerOperational => Role::Follower,
            Phase::CandidateTimer => Role::Candidate,
            Phase::LeaderBootstrap | Phase::LeaderOperational => Role::Leader,
        }
    }

    pub fn state(self) -> State {
        match self {
            Phase::FollowerDormant => State::Dormant,
            Phase::FollowerTimer | Phase::CandidateTimer => State::Timer,
            Phase::FollowerInductee => State::Inductee,
            Phase::FollowerBootstrap | Phase::LeaderBootstrap => State::Bootstrap,
            Phase::FollowerOperational | Phase::LeaderOperational => State::Operational,
        }
    }

    /// Capabilities held by the behavior of this phase
    pub fn capabilities(self) -> CapabilitySet {
        use Capability::*;

        let caps: &[Capability] = match self {
            Phase::FollowerDormant => &[AcceptNewServer, DiscoverCluster],
            Phase::FollowerTimer => &[Time, AcceptNewServer, DiscoverCluster],
            Phase::FollowerInductee => &[Heartbeat, AcceptNewServer],
            Phase::FollowerBootstrap => &[Heartbeat, AcceptNewServer],
            Phase::FollowerOperational => &[
                Heartbeat,
                ClientRead,
                ClientWrite,
                AcceptNewServer,
                RemoveServer,
                FindCluster,
            ],
            Phase::CandidateTimer => &[Time, AcceptNewServer],
            Phase::LeaderBootstrap => &[Heartbeat, AcceptNewServer, RemoveServer, DiscoverCluster],
            Phase::LeaderOperational => &[
                Heartbeat,
                ClientRead,
                ClientWrite,
                AcceptNewServer,
                RemoveServer,
                FindCluster,
            ],
        };
        CapabilitySet::of(caps)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.role(), self.state())
    }
}

/// Externally visible snapshot of a node's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: Role,
    pub state: State,
    pub capabilities: CapabilitySet,
    pub term: Term,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
    pub live_peers: usize,
}

impl NodeStatus {
    pub fn new(phase: Phase) -> Self {
        Self {
            role: phase.role(),
            state: phase.state(),
            capabilities: phase.capabilities(),
            term: Term(0),
            leader: None,
            members: Vec::new(),
            live_peers: 0,
        }
    }

    /// Fail unless the current phase holds `capability`
    pub fn ensure(&self, capability: Capability) -> Result<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(ConsensusError::CapabilityDenied {
                capability,
                role: self.role,
                state: self.state,
            })
        }
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::new(Phase::FollowerDormant)
    }
}

/// Candidate-specific state
#[derive(Debug, Clone)]
pub struct CandidateState {
    /// Members that have granted votes in this election
    pub votes_received: HashSet<Address>,
}

impl CandidateState {
    pub fn new() -> Self {
        Self {
            votes_received: HashSet::new(),
        }
    }

    pub fn add_vote(&mut self, voter: Address) {
        self.votes_received.insert(voter);
    }

    pub fn has_majority(&self, cluster_size: usize) -> bool {
        // +1 for self
        self.votes_received.len() + 1 >= quorum_size(cluster_size)
    }
}

impl Default for CandidateState {
    fn default() -> Self {
        Self::new()
    }
}

/// Volatile state on leaders (reinitialized after election)
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    /// For each follower, index of highest log entry known to be present
    pub match_index: HashMap<Address, LogIndex>,

    /// Followers that asked for induction and are not yet inducted
    pub inducting: HashSet<Address>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_match_index(&mut self, follower: Address, index: LogIndex) {
        let entry = self.match_index.entry(follower).or_insert(LogIndex::ZERO);
        if index > *entry {
            *entry = index;
        }
    }

    /// Highest index present on a quorum of the cluster, the leader included
    pub fn quorum_index(&self, own_index: LogIndex, cluster_size: usize) -> Option<LogIndex> {
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(own_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.get(quorum_size(cluster_size) - 1).copied()
    }
}
