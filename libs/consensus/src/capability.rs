//! Capabilities granted to a behavior

use serde::{Deserialize, Serialize};
use std::fmt;

/// A permission tag bound to a (role, state) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Runs an election timer
    Time,
    /// Sends or accepts heartbeats
    Heartbeat,
    ClientRead,
    ClientWrite,
    /// Dials known members to grow the connected set
    DiscoverCluster,
    AcceptNewServer,
    RemoveServer,
    /// Reconciles committed cluster configuration against live gateways
    FindCluster,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Time,
        Capability::Heartbeat,
        Capability::ClientRead,
        Capability::ClientWrite,
        Capability::DiscoverCluster,
        Capability::AcceptNewServer,
        Capability::RemoveServer,
        Capability::FindCluster,
    ];

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Time => "TIME",
            Capability::Heartbeat => "HEARTBEAT",
            Capability::ClientRead => "CLIENTREAD",
            Capability::ClientWrite => "CLIENTWRITE",
            Capability::DiscoverCluster => "DISCOVERCLUSTER",
            Capability::AcceptNewServer => "ACCEPTNEWSERVER",
            Capability::RemoveServer => "REMOVESERVER",
            Capability::FindCluster => "FINDCLUSTER",
        };
        f.write_str(name)
    }
}

/// A set of capabilities
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub fn of(capabilities: &[Capability]) -> Self {
        capabilities
            .iter()
            .fold(Self::EMPTY, |set, &cap| set.with(cap))
    }

    pub fn with(self, capability: Capability) -> Self {
        CapabilitySet(self.0 | capability.bit())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
