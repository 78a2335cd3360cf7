//! Peer RPCs and the core's inbound events

use crate::gateway::Gateway;
use crate::membership::ClusterView;
use crate::snapshot::Snapshot;
use crate::types::{Address, ConnectionId, LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Wire envelope: every RPC carries the sender's identity and cluster view
///
/// Membership propagation rides on the consensus protocol this way; there is
/// no separate gossip channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Advertised address of the sender
    pub from: Address,

    /// Sender's view of the cluster at send time
    pub view: ClusterView,

    pub rpc: Rpc,
}

/// Peer-to-peer RPCs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Rpc {
    /// Sent on connection establishment by both sides
    Handshake,

    /// Sent by candidates to gather votes
    RequestVote { term: Term, last_index: LogIndex },

    /// Reply to [`Rpc::RequestVote`]
    Vote { term: Term, granted: bool },

    /// Leader heartbeat; `index` is the leader's last index
    AppendEntries {
        term: Term,
        index: LogIndex,
        commit: LogIndex,
    },

    /// Leader ships a snapshot to a bootstrapping follower
    InstallSnapshot { term: Term, snapshot: Snapshot },

    /// Follower asks the leader to bootstrap it
    Induct { term: Term },

    /// Leader accepts an induction; the follower should catch up to `index`
    Bootstrap { term: Term, index: LogIndex },

    /// Follower restored local state up to `index`
    Bootstrapped { index: LogIndex },

    /// Leader promotes a caught-up follower to full voting/serving status
    Inducted { term: Term, commit: LogIndex },

    /// Follower reports the index it holds, in reply to AppendEntries
    InstallIndex { term: Term, index: LogIndex },
}

impl Rpc {
    pub fn name(&self) -> &'static str {
        match self {
            Rpc::Handshake => "Handshake",
            Rpc::RequestVote { .. } => "RequestVote",
            Rpc::Vote { .. } => "Vote",
            Rpc::AppendEntries { .. } => "AppendEntries",
            Rpc::InstallSnapshot { .. } => "InstallSnapshot",
            Rpc::Induct { .. } => "Induct",
            Rpc::Bootstrap { .. } => "Bootstrap",
            Rpc::Bootstrapped { .. } => "Bootstrapped",
            Rpc::Inducted { .. } => "Inducted",
            Rpc::InstallIndex { .. } => "InstallIndex",
        }
    }

    /// Term carried by the RPC, if any
    pub fn term(&self) -> Option<Term> {
        match self {
            Rpc::RequestVote { term, .. }
            | Rpc::Vote { term, .. }
            | Rpc::AppendEntries { term, .. }
            | Rpc::InstallSnapshot { term, .. }
            | Rpc::Induct { term }
            | Rpc::Bootstrap { term, .. }
            | Rpc::Inducted { term, .. }
            | Rpc::InstallIndex { term, .. } => Some(*term),
            Rpc::Handshake | Rpc::Bootstrapped { .. } => None,
        }
    }
}

/// Events delivered to the core on its inbound channel
#[derive(Debug)]
pub enum Message {
    /// The transport admitted a new peer connection
    AddServerRequest { gateway: Gateway },

    /// A decoded RPC arrived on a connection
    Rpc {
        connection: ConnectionId,
        envelope: Envelope,
    },

    /// The transport lost a connection
    ConnectionClosed { connection: ConnectionId },

    /// The transport could not reach an address the core asked to dial
    DialFailed { address: Address },
}
