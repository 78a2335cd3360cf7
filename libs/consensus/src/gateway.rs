//! Per-connection gateways and the peer registry
//!
//! A connection is represented twice: the core owns a [`Gateway`] in its
//! [`PeerRegistry`] and the transport owns the matching [`GatewayLink`].
//! The link writes decoded RPCs into the core's shared inbound channel and
//! drains the gateway's bounded outbound queue onto the socket.

use crate::config::OverflowPolicy;
use crate::rpc::{Envelope, Message};
use crate::types::{Address, ConnectionId};
use crate::{ConsensusError, Result};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener; the peer address is only known after its
    /// first envelope
    Inbound,
    /// Dialed by us towards a known member address
    Outbound,
}

/// Core-side endpoint of one peer connection
#[derive(Debug)]
pub struct Gateway {
    connection: ConnectionId,
    address: Address,
    direction: Direction,
    outbound: async_channel::Sender<Envelope>,
}

/// Transport-side endpoint of one peer connection
#[derive(Debug)]
pub struct GatewayLink {
    connection: ConnectionId,
    inbound: mpsc::Sender<Message>,
    outbound: async_channel::Receiver<Envelope>,
    policy: OverflowPolicy,
}

impl Gateway {
    /// Create the two ends of a connection
    pub fn open(
        connection: ConnectionId,
        address: Address,
        direction: Direction,
        inbound: mpsc::Sender<Message>,
        outbound_capacity: usize,
        policy: OverflowPolicy,
    ) -> (Gateway, GatewayLink) {
        let (tx, rx) = async_channel::bounded(outbound_capacity);

        let gateway = Gateway {
            connection,
            address,
            direction,
            outbound: tx,
        };
        let link = GatewayLink {
            connection,
            inbound,
            outbound: rx,
            policy,
        };
        (gateway, link)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    /// Queue an envelope for the peer without waiting
    ///
    /// The core never blocks on a slow peer: a full queue is reported as
    /// backpressure and the caller drops the gateway.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound.try_send(envelope).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => ConsensusError::Backpressure(self.connection),
            async_channel::TrySendError::Closed(_) => {
                ConsensusError::GatewayClosed(self.connection)
            }
        })
    }

    pub fn close(&self) {
        self.outbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl GatewayLink {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Hand a decoded envelope to the core
    ///
    /// Under [`OverflowPolicy::DropConnection`] a full inbound queue fails
    /// with [`ConsensusError::Backpressure`] and the transport is expected to
    /// close the connection; under [`OverflowPolicy::Wait`] this waits for
    /// capacity.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let message = Message::Rpc {
            connection: self.connection,
            envelope,
        };

        match self.policy {
            OverflowPolicy::DropConnection => {
                self.inbound.try_send(message).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        ConsensusError::Backpressure(self.connection)
                    }
                    mpsc::error::TrySendError::Closed(_) => ConsensusError::ShuttingDown,
                })
            }
            OverflowPolicy::Wait => self
                .inbound
                .send(message)
                .await
                .map_err(|_| ConsensusError::ShuttingDown),
        }
    }

    /// Next envelope the core wants written to the peer
    ///
    /// Returns `None` once the core closed or dropped the gateway.
    pub async fn next_outbound(&self) -> Option<Envelope> {
        self.outbound.recv().await.ok()
    }

    /// Next queued envelope, without waiting
    pub fn try_next_outbound(&self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }

    /// Tell the core the connection is gone
    pub async fn close(self) {
        self.outbound.close();
        let closed = Message::ConnectionClosed {
            connection: self.connection,
        };
        if self.inbound.send(closed).await.is_err() {
            debug!(connection = %self.connection, "core gone before connection close");
        }
    }
}

/// Live peer connections, owned by the consensus server
#[derive(Debug, Default)]
pub struct PeerRegistry {
    gateways: HashMap<ConnectionId, Gateway>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gateway: Gateway) {
        if let Some(previous) = self.gateways.insert(gateway.connection, gateway) {
            previous.close();
        }
    }

    /// Remove and close a gateway
    pub fn remove(&mut self, connection: ConnectionId) -> Option<Gateway> {
        let gateway = self.gateways.remove(&connection)?;
        gateway.close();
        Some(gateway)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&Gateway> {
        self.gateways.get(&connection)
    }

    pub fn get_mut(&mut self, connection: ConnectionId) -> Option<&mut Gateway> {
        self.gateways.get_mut(&connection)
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.gateways.contains_key(&connection)
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Connections currently bound to `address`, lowest id first
    pub fn connections_to(&self, address: &Address) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .gateways
            .values()
            .filter(|g| &g.address == address)
            .map(|g| g.connection)
            .collect();
        ids.sort();
        ids
    }

    pub fn is_connected_to(&self, address: &Address) -> bool {
        self.gateways.values().any(|g| &g.address == address)
    }

    /// Number of gateways whose peer satisfies `is_member`
    pub fn live(&self, is_member: impl Fn(&Address) -> bool) -> usize {
        self.gateways.values().filter(|g| is_member(&g.address)).count()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.gateways.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Send to one peer
    pub fn send(&self, connection: ConnectionId, envelope: Envelope) -> Result<()> {
        self.gateways
            .get(&connection)
            .ok_or(ConsensusError::GatewayClosed(connection))?
            .send(envelope)
    }

    /// Send to every peer, returning the connections that failed
    pub fn broadcast(&self, envelope: &Envelope) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for id in self.connections() {
            if let Some(gateway) = self.gateways.get(&id) {
                if gateway.send(envelope.clone()).is_err() {
                    failed.push(id);
                }
            }
        }
        failed
    }

    pub fn close_all(&mut self) {
        for (_, gateway) in self.gateways.drain() {
            gateway.close();
        }
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
