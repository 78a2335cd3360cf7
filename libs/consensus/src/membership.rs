//! Cluster view, membership gossip merge and quorum arithmetic
//!
//! Membership is propagated by piggy-backing a [`ClusterView`] on every RPC.
//! Views are merged on receipt, never overwritten, so the member set only
//! grows by gossip. This is a best-effort convergent gossip, not a
//! linearizable membership log: competing leadership claims are resolved by
//! receipt order.

use crate::types::Address;
use serde::{Deserialize, Serialize};

/// One node's belief about cluster composition at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Leader known to the sender, if any
    pub leader_address: Option<Address>,

    /// True iff the sender is itself the leader (then `leader_address` is
    /// the sender's own address)
    pub is_leader: bool,

    /// Other members known to the sender, without duplicates and without the
    /// sender itself
    pub members: Vec<Address>,
}

impl ClusterView {
    /// Number of nodes in the cluster described by this view, sender included
    pub fn cluster_size(&self) -> usize {
        self.members.len() + 1
    }
}

/// Minimum number of reachable nodes (self included) in a cluster of `n`
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

/// Whether `live` connected members plus self form a quorum of `view`
pub fn has_quorum(view: &ClusterView, live: usize) -> bool {
    live + 1 >= quorum_size(view.cluster_size())
}

/// Merge an incoming view into a local one
///
/// Members are the union of both sides in local-then-incoming order.
/// An incoming leadership claim naming a different leader wins over the
/// local belief because it was received last; a claim for the leader we
/// already trust leaves the local view untouched. Hearsay about a leader
/// (an address without a claim) only fills an unknown leader.
pub fn merge_view(local: &ClusterView, incoming: &ClusterView) -> ClusterView {
    let mut members = local.members.clone();
    for member in &incoming.members {
        if !members.contains(member) {
            members.push(member.clone());
        }
    }

    let (leader_address, is_leader) = if incoming.is_leader
        && incoming.leader_address.is_some()
        && incoming.leader_address != local.leader_address
    {
        (incoming.leader_address.clone(), false)
    } else if local.leader_address.is_none() && incoming.leader_address.is_some() {
        (incoming.leader_address.clone(), false)
    } else {
        (local.leader_address.clone(), local.is_leader)
    };

    ClusterView {
        leader_address,
        is_leader,
        members,
    }
}

/// The local node's membership state
#[derive(Debug, Clone)]
pub struct Membership {
    own: Address,
    members: Vec<Address>,
    leader: Option<Address>,
    min_cluster_size: usize,
}

impl Membership {
    pub fn new(own: Address, min_cluster_size: usize) -> Self {
        Self {
            own,
            members: Vec::new(),
            leader: None,
            min_cluster_size,
        }
    }

    pub fn own(&self) -> &Address {
        &self.own
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// Add a member, returning true if it was not known before
    pub fn insert(&mut self, address: Address) -> bool {
        if address == self.own || self.members.contains(&address) {
            return false;
        }
        self.members.push(address);
        true
    }

    pub fn remove(&mut self, address: &Address) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != address);
        if self.leader.as_ref() == Some(address) {
            self.leader = None;
        }
        self.members.len() != before
    }

    pub fn leader(&self) -> Option<&Address> {
        self.leader.as_ref()
    }

    pub fn set_leader(&mut self, leader: Option<Address>) {
        self.leader = leader;
    }

    /// Number of nodes in the cluster, self included
    pub fn cluster_size(&self) -> usize {
        self.members.len() + 1
    }

    /// The view this node advertises on outbound RPCs
    pub fn view(&self, is_leader: bool) -> ClusterView {
        if is_leader {
            ClusterView {
                leader_address: Some(self.own.clone()),
                is_leader: true,
                members: self.members.clone(),
            }
        } else {
            ClusterView {
                leader_address: self.leader.clone(),
                is_leader: false,
                members: self.members.clone(),
            }
        }
    }

    /// Merge a peer's view, returning true if anything changed
    pub fn merge(&mut self, incoming: &ClusterView) -> bool {
        let own = &self.own;
        let claims_us = incoming.leader_address.as_ref() == Some(own);
        let incoming = ClusterView {
            leader_address: if claims_us {
                None
            } else {
                incoming.leader_address.clone()
            },
            is_leader: incoming.is_leader && !claims_us,
            members: incoming
                .members
                .iter()
                .filter(|m| *m != own)
                .cloned()
                .collect(),
        };

        let local = self.view(false);
        let merged = merge_view(&local, &incoming);
        let changed = merged.members != local.members || merged.leader_address != local.leader_address;

        self.members = merged.members;
        self.leader = merged.leader_address;
        changed
    }

    /// Quorum check with the configured cluster size floor applied
    pub fn is_quorate(&self, live: usize) -> bool {
        let view = self.view(false);
        has_quorum(&view, live) && view.cluster_size() >= self.min_cluster_size
    }
}
