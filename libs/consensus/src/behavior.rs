//! Per-phase behaviors
//!
//! Every [`Phase`] has exactly one handler here, selected by the exhaustive
//! match in [`Core::step`]. Handlers consume one event, mutate the node state
//! and registry, and decide whether the phase ends. They never block and hold
//! no timers or randomness of their own, so the same state and event always
//! produce the same [`Step`].
//!
//! Before any handler runs, every message goes through the same admission
//! path: new connections are registered and greeted with a handshake, closed
//! connections are dropped, and each RPC's piggy-backed cluster view is merged.
//! After a handler stays in its phase, quorum and leader contact are
//! re-evaluated ([`Core::settle`]).

use crate::capability::Capability;
use crate::config::ConsensusConfig;
use crate::gateway::{Direction, Gateway, PeerRegistry};
use crate::membership::Membership;
use crate::rpc::{Envelope, Message, Rpc};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::{CandidateState, LeaderState, Phase, Role};
use crate::types::{Address, ConnectionId, LogIndex, Term};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something the active behavior has to react to
#[derive(Debug)]
pub(crate) enum Event {
    Inbound(Message),
    ElectionTimeout,
    HeartbeatTick,
}

/// Outcome of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Stay,
    /// Stay, restarting the election timer
    ResetElectionTimer,
    /// End the current behavior and install the given phase
    Transition(Phase),
}

/// An event after admission processing
enum Input {
    Rpc {
        connection: ConnectionId,
        from: Address,
        rpc: Rpc,
    },
    ElectionTimeout,
    HeartbeatTick,
}

/// State that survives across behaviors
pub(crate) struct Core {
    pub(crate) membership: Membership,
    pub(crate) registry: PeerRegistry,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<Address>,
    pub(crate) last_index: LogIndex,
    pub(crate) commit_index: LogIndex,
    leader_connection: Option<ConnectionId>,
    candidate: CandidateState,
    leader_state: LeaderState,
    noop_index: LogIndex,
    seeds: Vec<Address>,
    dialing: HashSet<Address>,
    /// Dialed addresses that turned out to name another member (or us)
    aliases: HashMap<Address, Address>,
    dial_cursor: usize,
    dials: mpsc::Sender<Address>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl Core {
    pub(crate) fn new(
        own: Address,
        config: &ConsensusConfig,
        dials: mpsc::Sender<Address>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            membership: Membership::new(own, config.min_cluster_size),
            registry: PeerRegistry::new(),
            term: Term(0),
            voted_for: None,
            last_index: LogIndex::ZERO,
            commit_index: LogIndex::ZERO,
            leader_connection: None,
            candidate: CandidateState::new(),
            leader_state: LeaderState::new(),
            noop_index: LogIndex::ZERO,
            seeds: config.seeds.clone(),
            dialing: HashSet::new(),
            aliases: HashMap::new(),
            dial_cursor: 0,
            dials,
            snapshots,
        }
    }

    /// Connections to identified members
    pub(crate) fn live(&self) -> usize {
        let membership = &self.membership;
        self.registry.live(|address| membership.contains(address))
    }

    pub(crate) fn is_quorate(&self) -> bool {
        self.membership.is_quorate(self.live())
    }

    pub(crate) fn leader(&self, phase: Phase) -> Option<Address> {
        if phase.role() == Role::Leader {
            Some(self.membership.own().clone())
        } else {
            self.membership.leader().cloned()
        }
    }

    /// Entry actions of a freshly installed behavior
    pub(crate) fn enter(&mut self, phase: Phase) -> Step {
        let step = match phase {
            Phase::FollowerDormant
            | Phase::FollowerTimer
            | Phase::FollowerOperational
            | Phase::LeaderOperational => Step::Stay,
            Phase::FollowerInductee => self.enter_inductee(),
            Phase::FollowerBootstrap => self.enter_bootstrap(),
            Phase::CandidateTimer => self.enter_candidate(),
            Phase::LeaderBootstrap => self.enter_leader(),
        };
        self.settle(phase, step)
    }

    /// Handle exactly one event in `phase`
    pub(crate) fn step(&mut self, phase: Phase, event: Event) -> Step {
        let input = match event {
            Event::Inbound(message) => match self.absorb(phase, message) {
                Some(input) => input,
                None => return self.settle(phase, Step::Stay),
            },
            Event::ElectionTimeout => Input::ElectionTimeout,
            Event::HeartbeatTick => Input::HeartbeatTick,
        };

        let step = match phase {
            Phase::FollowerDormant => self.dormant_follower(input),
            Phase::FollowerTimer => self.timer_follower(input),
            Phase::FollowerInductee => self.inductee_follower(input),
            Phase::FollowerBootstrap => self.bootstrap_follower(input),
            Phase::FollowerOperational => self.operational_follower(input),
            Phase::CandidateTimer => self.candidate(input),
            Phase::LeaderBootstrap => self.lead(Phase::LeaderBootstrap, input),
            Phase::LeaderOperational => self.lead(Phase::LeaderOperational, input),
        };
        self.settle(phase, step)
    }

    /// Re-evaluate leader contact and quorum after the registry or view changed
    fn settle(&mut self, phase: Phase, step: Step) -> Step {
        if let Step::Transition(_) = step {
            return step;
        }

        if let Some(connection) = self.leader_connection {
            if !self.registry.contains(connection) {
                self.leader_connection = None;
                match phase {
                    Phase::FollowerInductee | Phase::FollowerBootstrap => {
                        info!("Leader contact lost during induction, retrying from DORMANT");
                        return Step::Transition(Phase::FollowerDormant);
                    }
                    Phase::FollowerOperational => {
                        info!("Leader contact lost");
                        return Step::Transition(Phase::FollowerTimer);
                    }
                    _ => {}
                }
            }
        }

        let quorate = self.is_quorate();
        match phase {
            Phase::FollowerDormant if quorate => {
                info!(live = self.live(), members = self.membership.cluster_size(), "Quorum reached");
                return Step::Transition(Phase::FollowerTimer);
            }
            // Mid-induction phases only give up when leader contact is lost
            Phase::FollowerDormant | Phase::FollowerInductee | Phase::FollowerBootstrap => {}
            _ if !quorate => {
                info!(live = self.live(), members = self.membership.cluster_size(), "Quorum lost");
                return Step::Transition(Phase::FollowerDormant);
            }
            _ => {}
        }

        self.discover(phase);
        step
    }

    // ----- admission -----

    fn absorb(&mut self, phase: Phase, message: Message) -> Option<Input> {
        match message {
            Message::AddServerRequest { gateway } => {
                self.admit(phase, gateway);
                None
            }
            Message::ConnectionClosed { connection } => {
                self.drop_peer(connection, "connection closed");
                None
            }
            Message::DialFailed { address } => {
                debug!(peer = %address, "Dial failed");
                self.dialing.remove(&address);
                None
            }
            Message::Rpc {
                connection,
                envelope,
            } => self.receive(connection, envelope),
        }
    }

    fn admit(&mut self, phase: Phase, mut gateway: Gateway) {
        let connection = gateway.connection();
        let direction = gateway.direction();
        if direction == Direction::Outbound {
            if let Some(canonical) = self.aliases.get(gateway.address()) {
                self.dialing.remove(gateway.address());
                gateway.set_address(canonical.clone());
            }
        }
        let address = gateway.address().clone();

        if !phase.capabilities().contains(Capability::AcceptNewServer) {
            warn!(%connection, peer = %address, %phase, "Not accepting new servers");
            gateway.close();
            return;
        }

        info!(%connection, peer = %address, ?direction, "Admitting peer connection");
        if direction == Direction::Outbound {
            self.dialing.remove(&address);
            self.membership.insert(address.clone());
        }
        self.registry.insert(gateway);
        self.send(phase, connection, Rpc::Handshake);

        if direction == Direction::Outbound {
            self.dedup(&address);
        }
    }

    fn receive(&mut self, connection: ConnectionId, envelope: Envelope) -> Option<Input> {
        let Envelope { from, view, rpc } = envelope;

        let Some(gateway) = self.registry.get_mut(connection) else {
            debug!(%connection, rpc = rpc.name(), "RPC on unknown connection");
            return None;
        };
        if gateway.address() != &from {
            debug!(%connection, peer = %from, "Identified peer");
            let dialed = gateway.address().clone();
            let direction = gateway.direction();
            gateway.set_address(from.clone());
            if direction == Direction::Outbound {
                self.record_alias(dialed, from.clone());
            }
        }

        if &from == self.membership.own() {
            self.drop_peer(connection, "connected to self");
            return None;
        }

        self.dedup(&from);
        if !self.registry.contains(connection) {
            return None;
        }

        self.membership.insert(from.clone());
        if self.membership.merge(&view) {
            for alias in self.aliases.keys() {
                self.membership.remove(alias);
            }
            debug!(members = ?self.membership.members(), leader = ?self.membership.leader(), "Merged cluster view");
        }

        Some(Input::Rpc {
            connection,
            from,
            rpc,
        })
    }

    /// `dialed` reached the node that advertises itself as `canonical`
    fn record_alias(&mut self, dialed: Address, canonical: Address) {
        info!(%dialed, peer = %canonical, "Dialed address is an alias");
        self.dialing.remove(&dialed);
        self.membership.remove(&dialed);
        self.aliases.insert(dialed, canonical);
    }

    /// Keep a single connection per peer
    ///
    /// Both ends keep the connection dialed by the lower address, so they
    /// agree without exchanging anything.
    fn dedup(&mut self, address: &Address) {
        let connections = self.registry.connections_to(address);
        if connections.len() < 2 {
            return;
        }

        let keep_direction = if self.membership.own() < address {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let keep = connections
            .iter()
            .copied()
            .find(|c| self.registry.get(*c).map(|g| g.direction()) == Some(keep_direction))
            .unwrap_or(connections[0]);

        for connection in connections {
            if connection == keep {
                continue;
            }
            if self.leader_connection == Some(connection) {
                self.leader_connection = Some(keep);
            }
            self.drop_peer(connection, "duplicate connection");
        }
    }

    fn drop_peer(&mut self, connection: ConnectionId, reason: &'static str) {
        let Some(gateway) = self.registry.remove(connection) else {
            return;
        };
        info!(%connection, peer = %gateway.address(), reason, "Dropping peer");

        if self.leader_connection == Some(connection)
            && self.membership.leader() == Some(gateway.address())
        {
            self.membership.set_leader(None);
        }
        self.leader_state.inducting.remove(gateway.address());
    }

    // ----- outbound -----

    fn envelope(&self, phase: Phase, rpc: Rpc) -> Envelope {
        Envelope {
            from: self.membership.own().clone(),
            view: self.membership.view(phase.role() == Role::Leader),
            rpc,
        }
    }

    fn send(&mut self, phase: Phase, connection: ConnectionId, rpc: Rpc) {
        let envelope = self.envelope(phase, rpc);
        if let Err(e) = self.registry.send(connection, envelope) {
            warn!(%connection, error = %e, "Peer unreachable");
            self.drop_peer(connection, "send failed");
        }
    }

    fn broadcast(&mut self, phase: Phase, rpc: Rpc) {
        let envelope = self.envelope(phase, rpc);
        for connection in self.registry.broadcast(&envelope) {
            warn!(%connection, "Peer unreachable");
            self.drop_peer(connection, "send failed");
        }
    }

    /// Ask the transport to connect to members we are not connected to
    fn discover(&mut self, phase: Phase) {
        let capabilities = phase.capabilities();

        if capabilities.contains(Capability::DiscoverCluster) {
            // one address at a time, and only while below quorum
            if !self.dialing.is_empty() || self.is_quorate() {
                return;
            }
            let candidates = self.unconnected();
            if candidates.is_empty() {
                return;
            }
            let address = candidates[self.dial_cursor % candidates.len()].clone();
            self.dial_cursor = self.dial_cursor.wrapping_add(1);
            self.request_dial(address);
        } else if capabilities.contains(Capability::FindCluster) {
            for address in self.unconnected() {
                self.request_dial(address);
            }
        }
    }

    fn unconnected(&self) -> Vec<Address> {
        let mut candidates: Vec<Address> = Vec::new();
        for address in self.membership.members().iter().chain(self.seeds.iter()) {
            let target = self.aliases.get(address).unwrap_or(address);
            if target != self.membership.own()
                && !self.registry.is_connected_to(target)
                && !self.dialing.contains(address)
                && !self.dialing.contains(target)
                && !candidates.contains(target)
            {
                candidates.push(target.clone());
            }
        }
        candidates
    }

    fn request_dial(&mut self, address: Address) {
        match self.dials.try_send(address.clone()) {
            Ok(()) => {
                debug!(peer = %address, "Requesting dial");
                self.dialing.insert(address);
            }
            Err(mpsc::error::TrySendError::Full(_)) => debug!("Dial queue full"),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ----- shared protocol pieces -----

    fn observe_term(&mut self, term: Term) -> bool {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    /// Answer a vote request, returning whether the vote was granted
    fn answer_vote(
        &mut self,
        phase: Phase,
        connection: ConnectionId,
        candidate: &Address,
        term: Term,
        last_index: LogIndex,
    ) -> bool {
        self.observe_term(term);

        let granted = term == self.term
            && self.voted_for.as_ref().map_or(true, |v| v == candidate)
            && last_index >= self.last_index;
        if granted {
            self.voted_for = Some(candidate.clone());
        }
        debug!(%candidate, %term, granted, "Answered vote request");

        self.send(
            phase,
            connection,
            Rpc::Vote {
                term: self.term,
                granted,
            },
        );
        granted
    }

    /// Adopt the sender of an AppendEntries as leader unless its term is stale
    fn accept_leader(
        &mut self,
        phase: Phase,
        connection: ConnectionId,
        leader: &Address,
        term: Term,
    ) -> bool {
        if term < self.term {
            debug!(%leader, %term, current = %self.term, "Rejecting stale leader");
            self.send(
                phase,
                connection,
                Rpc::InstallIndex {
                    term: self.term,
                    index: self.last_index,
                },
            );
            return false;
        }

        self.observe_term(term);
        if self.leader_connection != Some(connection) {
            info!(%leader, %term, "Following leader");
        }
        self.leader_connection = Some(connection);
        self.membership.set_leader(Some(leader.clone()));
        true
    }

    fn report_index(&mut self, phase: Phase, connection: ConnectionId) {
        self.send(
            phase,
            connection,
            Rpc::InstallIndex {
                term: self.term,
                index: self.last_index,
            },
        );
    }

    fn catch_up(&mut self, index: LogIndex, commit: LogIndex) {
        if index > self.last_index {
            self.last_index = index;
        }
        let commit = commit.min(self.last_index);
        if commit > self.commit_index {
            self.commit_index = commit;
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        let index = snapshot.metadata.last_included_index;
        info!(%index, "Restoring from snapshot");
        if index > self.last_index {
            self.last_index = index;
        }
        if index > self.commit_index {
            self.commit_index = index;
        }
        for member in snapshot.metadata.configuration {
            self.membership.insert(member);
        }
    }

    fn is_leader_connection(&self, connection: ConnectionId) -> bool {
        self.leader_connection == Some(connection)
    }

    fn ignore(&self, phase: Phase, rpc: &Rpc) -> Step {
        debug!(%phase, rpc = rpc.name(), "Ignoring unexpected RPC");
        Step::Stay
    }

    // ----- entry actions -----

    fn enter_inductee(&mut self) -> Step {
        let Some(leader) = self.leader_connection else {
            return Step::Transition(Phase::FollowerDormant);
        };
        info!(leader = ?self.membership.leader(), "Requesting induction");
        self.send(Phase::FollowerInductee, leader, Rpc::Induct { term: self.term });
        Step::Stay
    }

    fn enter_bootstrap(&mut self) -> Step {
        let Some(leader) = self.leader_connection else {
            return Step::Transition(Phase::FollowerDormant);
        };

        match self.snapshots.load() {
            Ok(Some(snapshot)) => self.restore(snapshot),
            Ok(None) => debug!("No local snapshot"),
            Err(e) => warn!(error = %e, "Unable to load local snapshot, replaying backlog"),
        }

        self.send(
            Phase::FollowerBootstrap,
            leader,
            Rpc::Bootstrapped {
                index: self.last_index,
            },
        );
        Step::Stay
    }

    fn enter_candidate(&mut self) -> Step {
        self.term.increment();
        self.voted_for = Some(self.membership.own().clone());
        self.candidate = CandidateState::new();
        self.leader_connection = None;
        self.membership.set_leader(None);

        info!(term = %self.term, "Starting election");
        if self.candidate.has_majority(self.membership.cluster_size()) {
            return Step::Transition(Phase::LeaderBootstrap);
        }

        self.broadcast(
            Phase::CandidateTimer,
            Rpc::RequestVote {
                term: self.term,
                last_index: self.last_index,
            },
        );
        Step::Stay
    }

    fn enter_leader(&mut self) -> Step {
        self.leader_state = LeaderState::new();
        self.leader_connection = None;
        self.membership.set_leader(None);

        // no-op entry whose commit reveals the quorum commit index
        self.last_index.increment();
        self.noop_index = self.last_index;
        info!(term = %self.term, noop = %self.noop_index, "Leading, committing no-op");

        self.heartbeat(Phase::LeaderBootstrap);
        self.advance_commit(Phase::LeaderBootstrap)
    }

    // ----- follower behaviors -----

    fn dormant_follower(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::FollowerDormant;
        let Input::Rpc {
            connection,
            from,
            rpc,
        } = input
        else {
            return Step::Stay;
        };

        match rpc {
            Rpc::Handshake => Step::Stay,
            Rpc::RequestVote { term, last_index } => {
                self.answer_vote(PHASE, connection, &from, term, last_index);
                Step::Stay
            }
            Rpc::AppendEntries { term, .. } => {
                if self.accept_leader(PHASE, connection, &from, term) {
                    Step::Transition(Phase::FollowerInductee)
                } else {
                    Step::Stay
                }
            }
            other => self.ignore(PHASE, &other),
        }
    }

    fn timer_follower(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::FollowerTimer;
        let (connection, from, rpc) = match input {
            Input::ElectionTimeout => {
                info!(term = %self.term, "Election timeout without leader contact");
                return Step::Transition(Phase::CandidateTimer);
            }
            Input::HeartbeatTick => return Step::Stay,
            Input::Rpc {
                connection,
                from,
                rpc,
            } => (connection, from, rpc),
        };

        match rpc {
            Rpc::Handshake => Step::Stay,
            Rpc::RequestVote { term, last_index } => {
                if self.answer_vote(PHASE, connection, &from, term, last_index) {
                    Step::ResetElectionTimer
                } else {
                    Step::Stay
                }
            }
            Rpc::AppendEntries { term, .. } => {
                if self.accept_leader(PHASE, connection, &from, term) {
                    Step::Transition(Phase::FollowerInductee)
                } else {
                    Step::Stay
                }
            }
            other => self.ignore(PHASE, &other),
        }
    }

    fn inductee_follower(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::FollowerInductee;
        let Input::Rpc {
            connection,
            from,
            rpc,
        } = input
        else {
            return Step::Stay;
        };

        match rpc {
            Rpc::Bootstrap { term, index } if self.is_leader_connection(connection) => {
                if term < self.term {
                    return self.ignore(PHASE, &Rpc::Bootstrap { term, index });
                }
                self.observe_term(term);
                info!(target_index = %index, "Induction accepted");
                Step::Transition(Phase::FollowerBootstrap)
            }
            Rpc::AppendEntries { term, .. } => {
                let previous = self.leader_connection;
                if self.accept_leader(PHASE, connection, &from, term) {
                    if previous != Some(connection) {
                        self.send(PHASE, connection, Rpc::Induct { term: self.term });
                    }
                    self.report_index(PHASE, connection);
                }
                Step::Stay
            }
            Rpc::RequestVote { term, last_index } => {
                self.answer_vote(PHASE, connection, &from, term, last_index);
                Step::Stay
            }
            Rpc::Handshake => Step::Stay,
            other => self.ignore(PHASE, &other),
        }
    }

    fn bootstrap_follower(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::FollowerBootstrap;
        let Input::Rpc {
            connection,
            from,
            rpc,
        } = input
        else {
            return Step::Stay;
        };

        match rpc {
            Rpc::AppendEntries {
                term,
                index,
                commit,
            } => {
                if self.accept_leader(PHASE, connection, &from, term) {
                    self.catch_up(index, commit);
                    self.report_index(PHASE, connection);
                }
                Step::Stay
            }
            Rpc::InstallSnapshot { term, snapshot }
                if self.is_leader_connection(connection) && term >= self.term =>
            {
                self.observe_term(term);
                if let Err(e) = self.snapshots.save(&snapshot) {
                    warn!(error = %e, "Unable to persist installed snapshot");
                }
                self.restore(snapshot);
                self.send(
                    PHASE,
                    connection,
                    Rpc::Bootstrapped {
                        index: self.last_index,
                    },
                );
                Step::Stay
            }
            Rpc::Inducted { term, commit }
                if self.is_leader_connection(connection) && term >= self.term =>
            {
                self.observe_term(term);
                self.catch_up(commit, commit);
                info!(commit = %self.commit_index, "Inducted");
                Step::Transition(Phase::FollowerOperational)
            }
            Rpc::RequestVote { term, last_index } => {
                self.answer_vote(PHASE, connection, &from, term, last_index);
                Step::Stay
            }
            Rpc::Handshake => Step::Stay,
            other => self.ignore(PHASE, &other),
        }
    }

    fn operational_follower(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::FollowerOperational;
        let Input::Rpc {
            connection,
            from,
            rpc,
        } = input
        else {
            return Step::Stay;
        };

        match rpc {
            Rpc::AppendEntries {
                term,
                index,
                commit,
            } => {
                if self.accept_leader(PHASE, connection, &from, term) {
                    self.catch_up(index, commit);
                    self.report_index(PHASE, connection);
                }
                Step::Stay
            }
            Rpc::RequestVote { term, last_index } => {
                self.answer_vote(PHASE, connection, &from, term, last_index);
                Step::Stay
            }
            Rpc::Handshake | Rpc::Inducted { .. } => Step::Stay,
            other => self.ignore(PHASE, &other),
        }
    }

    // ----- candidate -----

    fn candidate(&mut self, input: Input) -> Step {
        const PHASE: Phase = Phase::CandidateTimer;
        let (connection, from, rpc) = match input {
            Input::ElectionTimeout => {
                info!(term = %self.term, "Election timed out");
                return Step::Transition(Phase::CandidateTimer);
            }
            Input::HeartbeatTick => return Step::Stay,
            Input::Rpc {
                connection,
                from,
                rpc,
            } => (connection, from, rpc),
        };

        match rpc {
            Rpc::Vote { term, granted } => {
                if self.observe_term(term) {
                    info!(%term, "Newer term seen, abandoning election");
                    return Step::Transition(Phase::FollowerDormant);
                }
                if granted && term == self.term {
                    self.candidate.add_vote(from);
                    if self.candidate.has_majority(self.membership.cluster_size()) {
                        info!(term = %self.term, votes = self.candidate.votes_received.len() + 1, "Won election");
                        return Step::Transition(Phase::LeaderBootstrap);
                    }
                }
                Step::Stay
            }
            Rpc::RequestVote { term, last_index } => {
                let newer = term > self.term;
                self.answer_vote(PHASE, connection, &from, term, last_index);
                if newer {
                    Step::Transition(Phase::FollowerDormant)
                } else {
                    Step::Stay
                }
            }
            Rpc::AppendEntries { term, .. } => {
                if self.accept_leader(PHASE, connection, &from, term) {
                    Step::Transition(Phase::FollowerInductee)
                } else {
                    Step::Stay
                }
            }
            Rpc::Handshake => Step::Stay,
            other => self.ignore(PHASE, &other),
        }
    }

    // ----- leader -----

    fn heartbeat(&mut self, phase: Phase) {
        self.broadcast(
            phase,
            Rpc::AppendEntries {
                term: self.term,
                index: self.last_index,
                commit: self.commit_index,
            },
        );
    }

    fn induct(&mut self, phase: Phase, connection: ConnectionId, follower: &Address) {
        self.leader_state.inducting.remove(follower);
        info!(%follower, commit = %self.commit_index, "Inducting follower");
        self.send(
            phase,
            connection,
            Rpc::Inducted {
                term: self.term,
                commit: self.commit_index,
            },
        );
    }

    /// Send a lagging follower our snapshot if it covers more than the
    /// follower has, otherwise the backlog
    fn catch_up_follower(&mut self, phase: Phase, connection: ConnectionId, index: LogIndex) {
        match self.snapshots.load() {
            Ok(Some(snapshot)) if snapshot.metadata.last_included_index > index => {
                debug!(%connection, snapshot = %snapshot.metadata.last_included_index, "Shipping snapshot");
                self.send(
                    phase,
                    connection,
                    Rpc::InstallSnapshot {
                        term: self.term,
                        snapshot,
                    },
                );
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Unable to load snapshot for a lagging follower"),
        }

        self.send(
            phase,
            connection,
            Rpc::AppendEntries {
                term: self.term,
                index: self.last_index,
                commit: self.commit_index,
            },
        );
    }

    fn advance_commit(&mut self, phase: Phase) -> Step {
        let cluster_size = self.membership.cluster_size();
        if let Some(index) = self.leader_state.quorum_index(self.last_index, cluster_size) {
            if index > self.commit_index {
                debug!(commit = %index, "Commit index advanced");
                self.commit_index = index;
            }
        }

        if phase == Phase::LeaderBootstrap && self.commit_index >= self.noop_index {
            info!(commit = %self.commit_index, "No-op committed on a quorum");
            return Step::Transition(Phase::LeaderOperational);
        }
        Step::Stay
    }

    fn lead(&mut self, phase: Phase, input: Input) -> Step {
        let (connection, from, rpc) = match input {
            Input::HeartbeatTick => {
                self.heartbeat(phase);
                return Step::Stay;
            }
            Input::ElectionTimeout => return Step::Stay,
            Input::Rpc {
                connection,
                from,
                rpc,
            } => (connection, from, rpc),
        };

        if let Some(term) = rpc.term() {
            if term > self.term && !matches!(rpc, Rpc::AppendEntries { .. }) {
                // answer as a follower before stepping down
                if let Rpc::RequestVote { last_index, .. } = rpc {
                    self.answer_vote(Phase::FollowerDormant, connection, &from, term, last_index);
                } else {
                    self.observe_term(term);
                }
                info!(%term, "Newer term seen, stepping down");
                return Step::Transition(Phase::FollowerDormant);
            }
        }

        match rpc {
            Rpc::Handshake | Rpc::Vote { .. } => Step::Stay,
            Rpc::AppendEntries { term, .. } => {
                if term > self.term
                    && self.accept_leader(Phase::FollowerInductee, connection, &from, term)
                {
                    info!(%term, "Newer leader seen, stepping down");
                    return Step::Transition(Phase::FollowerInductee);
                }
                warn!(rival = %from, %term, "Ignoring AppendEntries from a rival leader");
                Step::Stay
            }
            Rpc::RequestVote { term, last_index } => {
                self.answer_vote(phase, connection, &from, term, last_index);
                Step::Stay
            }
            Rpc::Induct { .. } => {
                self.leader_state.inducting.insert(from);
                self.send(
                    phase,
                    connection,
                    Rpc::Bootstrap {
                        term: self.term,
                        index: self.commit_index,
                    },
                );
                Step::Stay
            }
            Rpc::Bootstrapped { index } => {
                self.leader_state.set_match_index(from.clone(), index);
                if index >= self.commit_index {
                    self.induct(phase, connection, &from);
                } else {
                    self.catch_up_follower(phase, connection, index);
                }
                self.advance_commit(phase)
            }
            Rpc::InstallIndex { index, .. } => {
                self.leader_state.set_match_index(from.clone(), index);
                if self.leader_state.inducting.contains(&from) && index >= self.commit_index {
                    self.induct(phase, connection, &from);
                }
                self.advance_commit(phase)
            }
            other => self.ignore(phase, &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusConfigBuilder, OverflowPolicy};
    use crate::gateway::GatewayLink;
    use crate::membership::ClusterView;
    use crate::snapshot::{MemorySnapshotStore, SnapshotMetadata};
    use crate::state::NodeStatus;
    use std::collections::HashMap;

    fn own() -> Address {
        Address::new("10.0.0.1", 7000)
    }

    fn peer(n: u8) -> Address {
        Address::new(format!("10.0.0.{n}"), 7000)
    }

    struct Harness {
        core: Core,
        dials: mpsc::Receiver<Address>,
        inbound: mpsc::Sender<Message>,
        _inbound_rx: mpsc::Receiver<Message>,
        links: HashMap<ConnectionId, GatewayLink>,
        next: u64,
    }

    impl Harness {
        fn new(min_cluster_size: usize) -> Self {
            Self::with_store(min_cluster_size, Arc::new(MemorySnapshotStore::new()), vec![])
        }

        fn with_store(
            min_cluster_size: usize,
            snapshots: Arc<dyn SnapshotStore>,
            seeds: Vec<Address>,
        ) -> Self {
            let config = ConsensusConfigBuilder::new()
                .min_cluster_size(min_cluster_size)
                .seeds(seeds)
                .build();
            let (dial_tx, dial_rx) = mpsc::channel(16);
            let (inbound, inbound_rx) = mpsc::channel(16);
            Self {
                core: Core::new(own(), &config, dial_tx, snapshots),
                dials: dial_rx,
                inbound,
                _inbound_rx: inbound_rx,
                links: HashMap::new(),
                next: 1,
            }
        }

        fn open(&mut self, address: Address, direction: Direction) -> (ConnectionId, Gateway) {
            let connection = ConnectionId(self.next);
            self.next += 1;
            let (gateway, link) = Gateway::open(
                connection,
                address,
                direction,
                self.inbound.clone(),
                64,
                OverflowPolicy::DropConnection,
            );
            self.links.insert(connection, link);
            (connection, gateway)
        }

        /// An inbound connection from `peer`, identified by a handshake
        fn join(&mut self, phase: Phase, peer: Address, members: Vec<Address>) -> (ConnectionId, Step) {
            let ephemeral = Address::new(peer.host.clone(), 50000 + self.next as u16);
            let (connection, gateway) = self.open(ephemeral, Direction::Inbound);
            assert_eq!(
                self.core.step(phase, Event::Inbound(Message::AddServerRequest { gateway })),
                Step::Stay
            );
            let view = ClusterView {
                members,
                ..Default::default()
            };
            let step = self.rpc(phase, connection, peer, view, Rpc::Handshake);
            (connection, step)
        }

        fn rpc(
            &mut self,
            phase: Phase,
            connection: ConnectionId,
            from: Address,
            view: ClusterView,
            rpc: Rpc,
        ) -> Step {
            let envelope = Envelope { from, view, rpc };
            self.core.step(
                phase,
                Event::Inbound(Message::Rpc {
                    connection,
                    envelope,
                }),
            )
        }

        fn close(&mut self, phase: Phase, connection: ConnectionId) -> Step {
            self.core.step(
                phase,
                Event::Inbound(Message::ConnectionClosed { connection }),
            )
        }

        fn sent(&self, connection: ConnectionId) -> Vec<Rpc> {
            let link = &self.links[&connection];
            std::iter::from_fn(|| link.try_next_outbound())
                .map(|e| e.rpc)
                .collect()
        }

        /// Dormant node with two identified peers, moved to TIMER
        fn quorate(&mut self) -> (ConnectionId, ConnectionId) {
            let (b, step) = self.join(Phase::FollowerDormant, peer(2), vec![]);
            assert_eq!(step, Step::Stay);
            let (c, step) = self.join(Phase::FollowerDormant, peer(3), vec![peer(2)]);
            assert_eq!(step, Step::Transition(Phase::FollowerTimer));
            assert_eq!(self.core.enter(Phase::FollowerTimer), Step::Stay);
            (b, c)
        }
    }

    fn leader_view(n: u8) -> ClusterView {
        ClusterView {
            leader_address: Some(peer(n)),
            is_leader: true,
            members: vec![own()],
        }
    }

    #[test]
    fn test_admission_sends_handshake_with_view() {
        let mut h = Harness::new(3);
        let (b, _) = h.join(Phase::FollowerDormant, peer(2), vec![]);

        let link = &h.links[&b];
        let envelope = link.try_next_outbound().unwrap();
        assert_eq!(envelope.from, own());
        assert_eq!(envelope.rpc, Rpc::Handshake);
        assert!(envelope.view.members.is_empty());
        assert!(!envelope.view.is_leader);
    }

    #[test]
    fn test_two_nodes_below_cluster_floor_stay_dormant() {
        let mut h = Harness::new(3);
        let (_, step) = h.join(Phase::FollowerDormant, peer(2), vec![]);

        assert_eq!(step, Step::Stay);
        assert_eq!(h.core.membership.members(), &[peer(2)]);
        assert_eq!(h.core.live(), 1);
        assert!(!h.core.is_quorate());

        let (_, step) = h.join(Phase::FollowerDormant, peer(3), vec![]);
        assert_eq!(step, Step::Transition(Phase::FollowerTimer));
    }

    #[test]
    fn test_two_node_rule_reaches_quorum() {
        let mut h = Harness::new(2);
        let (_, step) = h.join(Phase::FollowerDormant, peer(2), vec![]);
        assert_eq!(step, Step::Transition(Phase::FollowerTimer));
    }

    #[test]
    fn test_unidentified_connection_is_not_live() {
        let mut h = Harness::new(2);
        let (_, gateway) = h.open(Address::new("10.0.0.2", 51234), Direction::Inbound);
        let step = h
            .core
            .step(Phase::FollowerDormant, Event::Inbound(Message::AddServerRequest { gateway }));

        assert_eq!(step, Step::Stay);
        assert_eq!(h.core.live(), 0);
        assert!(h.core.membership.members().is_empty());
    }

    #[test]
    fn test_quorum_threshold_is_inclusive() {
        let mut h = Harness::new(3);
        let (b, c) = h.quorate();

        // 1 live + self = 2 == quorum_size(3)
        assert_eq!(h.close(Phase::FollowerTimer, c), Step::Stay);
        assert_eq!(h.core.live(), 1);

        assert_eq!(
            h.close(Phase::FollowerTimer, b),
            Step::Transition(Phase::FollowerDormant)
        );
    }

    #[test]
    fn test_send_failure_drops_gateway() {
        let mut h = Harness::new(3);
        let (_b, c) = h.quorate();

        h.links.remove(&c);
        let step = h.core.step(Phase::FollowerTimer, Event::ElectionTimeout);
        assert_eq!(step, Step::Transition(Phase::CandidateTimer));

        // the broadcast to the vanished peer fails and removes it
        assert_eq!(h.core.enter(Phase::CandidateTimer), Step::Stay);
        assert!(!h.core.registry.contains(c));
        assert_eq!(h.core.live(), 1);
    }

    #[test]
    fn test_dormant_grants_vote_without_transition() {
        let mut h = Harness::new(3);
        let (b, _) = h.join(Phase::FollowerDormant, peer(2), vec![]);
        h.sent(b);

        let step = h.rpc(
            Phase::FollowerDormant,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::RequestVote {
                term: Term(1),
                last_index: LogIndex::ZERO,
            },
        );

        assert_eq!(step, Step::Stay);
        assert_eq!(
            h.sent(b),
            vec![Rpc::Vote {
                term: Term(1),
                granted: true
            }]
        );
        assert_eq!(h.core.voted_for, Some(peer(2)));
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut h = Harness::new(3);
        let (b, c) = h.quorate();
        h.sent(b);
        h.sent(c);

        let request = Rpc::RequestVote {
            term: Term(1),
            last_index: LogIndex::ZERO,
        };
        let step = h.rpc(Phase::FollowerTimer, b, peer(2), ClusterView::default(), request.clone());
        assert_eq!(step, Step::ResetElectionTimer);

        let step = h.rpc(Phase::FollowerTimer, c, peer(3), ClusterView::default(), request);
        assert_eq!(step, Step::Stay);
        assert_eq!(
            h.sent(c),
            vec![Rpc::Vote {
                term: Term(1),
                granted: false
            }]
        );
    }

    #[test]
    fn test_timer_append_entries_switches_to_inductee() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.sent(b);

        let step = h.rpc(
            Phase::FollowerTimer,
            b,
            peer(2),
            leader_view(2),
            Rpc::AppendEntries {
                term: Term(4),
                index: LogIndex(3),
                commit: LogIndex(3),
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerInductee));
        assert_eq!(h.core.term, Term(4));
        assert_eq!(h.core.membership.leader(), Some(&peer(2)));

        assert_eq!(h.core.enter(Phase::FollowerInductee), Step::Stay);
        assert_eq!(h.sent(b), vec![Rpc::Induct { term: Term(4) }]);
    }

    #[test]
    fn test_stale_leader_is_rejected() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.core.term = Term(5);
        h.sent(b);

        let step = h.rpc(
            Phase::FollowerTimer,
            b,
            peer(2),
            leader_view(2),
            Rpc::AppendEntries {
                term: Term(2),
                index: LogIndex(1),
                commit: LogIndex(1),
            },
        );
        assert_eq!(step, Step::Stay);
        assert_eq!(
            h.sent(b),
            vec![Rpc::InstallIndex {
                term: Term(5),
                index: LogIndex::ZERO
            }]
        );
    }

    #[test]
    fn test_full_induction() {
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(7),
                last_included_term: Term(1),
                configuration: vec![peer(4)],
            },
            data: vec![],
        };
        let store = Arc::new(MemorySnapshotStore::with_snapshot(snapshot));
        let mut h = Harness::with_store(3, store, vec![]);
        let (b, _) = h.quorate();

        let append = Rpc::AppendEntries {
            term: Term(1),
            index: LogIndex(9),
            commit: LogIndex(8),
        };
        assert_eq!(
            h.rpc(Phase::FollowerTimer, b, peer(2), leader_view(2), append.clone()),
            Step::Transition(Phase::FollowerInductee)
        );
        h.core.enter(Phase::FollowerInductee);

        // heartbeats during induction are answered with our index
        assert_eq!(
            h.rpc(Phase::FollowerInductee, b, peer(2), leader_view(2), append.clone()),
            Step::Stay
        );

        let step = h.rpc(
            Phase::FollowerInductee,
            b,
            peer(2),
            leader_view(2),
            Rpc::Bootstrap {
                term: Term(1),
                index: LogIndex(8),
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerBootstrap));
        h.sent(b);

        assert_eq!(h.core.enter(Phase::FollowerBootstrap), Step::Stay);
        assert_eq!(
            h.sent(b),
            vec![Rpc::Bootstrapped {
                index: LogIndex(7)
            }]
        );
        assert!(h.core.membership.contains(&peer(4)));

        // writes are refused until inducted
        assert!(NodeStatus::new(Phase::FollowerBootstrap)
            .ensure(Capability::ClientWrite)
            .is_err());

        assert_eq!(
            h.rpc(Phase::FollowerBootstrap, b, peer(2), leader_view(2), append),
            Step::Stay
        );
        assert_eq!(
            h.sent(b),
            vec![Rpc::InstallIndex {
                term: Term(1),
                index: LogIndex(9)
            }]
        );

        let step = h.rpc(
            Phase::FollowerBootstrap,
            b,
            peer(2),
            leader_view(2),
            Rpc::Inducted {
                term: Term(1),
                commit: LogIndex(9),
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerOperational));
        assert_eq!(h.core.commit_index, LogIndex(9));
        assert!(NodeStatus::new(Phase::FollowerOperational)
            .ensure(Capability::ClientWrite)
            .is_ok());
    }

    #[test]
    fn test_leader_loss_aborts_induction() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.rpc(
            Phase::FollowerTimer,
            b,
            peer(2),
            leader_view(2),
            Rpc::AppendEntries {
                term: Term(1),
                index: LogIndex(1),
                commit: LogIndex(1),
            },
        );
        h.core.enter(Phase::FollowerInductee);

        assert_eq!(
            h.close(Phase::FollowerInductee, b),
            Step::Transition(Phase::FollowerDormant)
        );
        assert_eq!(h.core.membership.leader(), None);
    }

    #[test]
    fn test_inductee_ignores_quorum_loss() {
        let mut h = Harness::new(3);
        let (b, c) = h.quorate();
        h.rpc(
            Phase::FollowerTimer,
            b,
            peer(2),
            leader_view(2),
            Rpc::AppendEntries {
                term: Term(1),
                index: LogIndex(1),
                commit: LogIndex(1),
            },
        );
        h.core.enter(Phase::FollowerInductee);

        assert_eq!(h.close(Phase::FollowerInductee, c), Step::Stay);
    }

    #[test]
    fn test_operational_follower_loses_leader() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.core.leader_connection = Some(b);
        h.core.membership.set_leader(Some(peer(2)));

        // still quorate through c, so the node goes back to waiting for a leader
        assert_eq!(
            h.close(Phase::FollowerOperational, b),
            Step::Transition(Phase::FollowerTimer)
        );
    }

    #[test]
    fn test_election_and_leader_bootstrap() {
        let mut h = Harness::new(3);
        let (b, c) = h.quorate();
        h.sent(b);
        h.sent(c);

        assert_eq!(
            h.core.step(Phase::FollowerTimer, Event::ElectionTimeout),
            Step::Transition(Phase::CandidateTimer)
        );
        assert_eq!(h.core.enter(Phase::CandidateTimer), Step::Stay);
        let request = Rpc::RequestVote {
            term: Term(1),
            last_index: LogIndex::ZERO,
        };
        assert_eq!(h.sent(b), vec![request.clone()]);
        assert_eq!(h.sent(c), vec![request]);

        let step = h.rpc(
            Phase::CandidateTimer,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::Vote {
                term: Term(1),
                granted: true,
            },
        );
        assert_eq!(step, Step::Transition(Phase::LeaderBootstrap));

        assert_eq!(h.core.enter(Phase::LeaderBootstrap), Step::Stay);
        let heartbeat = Rpc::AppendEntries {
            term: Term(1),
            index: LogIndex(1),
            commit: LogIndex::ZERO,
        };
        let link = &h.links[&b];
        let envelope = link.try_next_outbound().unwrap();
        assert_eq!(envelope.rpc, heartbeat);
        assert!(envelope.view.is_leader);
        assert_eq!(envelope.view.leader_address, Some(own()));

        // leader must not serve writes before its no-op is on a quorum
        assert!(NodeStatus::new(Phase::LeaderBootstrap)
            .ensure(Capability::ClientWrite)
            .is_err());

        let step = h.rpc(
            Phase::LeaderBootstrap,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::InstallIndex {
                term: Term(1),
                index: LogIndex(1),
            },
        );
        assert_eq!(step, Step::Transition(Phase::LeaderOperational));
        assert_eq!(h.core.commit_index, LogIndex(1));
    }

    #[test]
    fn test_split_vote_restarts_election() {
        let mut h = Harness::new(3);
        h.quorate();
        h.core.enter(Phase::CandidateTimer);
        assert_eq!(h.core.term, Term(1));

        assert_eq!(
            h.core.step(Phase::CandidateTimer, Event::ElectionTimeout),
            Step::Transition(Phase::CandidateTimer)
        );
        h.core.enter(Phase::CandidateTimer);
        assert_eq!(h.core.term, Term(2));
    }

    #[test]
    fn test_candidate_steps_down_on_newer_term() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.core.enter(Phase::CandidateTimer);

        let step = h.rpc(
            Phase::CandidateTimer,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::Vote {
                term: Term(3),
                granted: false,
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerDormant));
        assert_eq!(h.core.term, Term(3));
    }

    #[test]
    fn test_leader_inducts_new_follower() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.core.term = Term(1);
        h.core.enter(Phase::LeaderBootstrap);
        h.rpc(
            Phase::LeaderBootstrap,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::InstallIndex {
                term: Term(1),
                index: LogIndex(1),
            },
        );

        let (d, step) = h.join(Phase::LeaderOperational, peer(4), vec![]);
        assert_eq!(step, Step::Stay);
        h.sent(d);

        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::Induct { term: Term(1) },
        );
        assert_eq!(
            h.sent(d),
            vec![Rpc::Bootstrap {
                term: Term(1),
                index: LogIndex(1)
            }]
        );

        // behind: the leader ships the backlog first
        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::Bootstrapped {
                index: LogIndex::ZERO,
            },
        );
        assert_eq!(
            h.sent(d),
            vec![Rpc::AppendEntries {
                term: Term(1),
                index: LogIndex(1),
                commit: LogIndex(1)
            }]
        );

        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::InstallIndex {
                term: Term(1),
                index: LogIndex(1),
            },
        );
        assert_eq!(
            h.sent(d),
            vec![Rpc::Inducted {
                term: Term(1),
                commit: LogIndex(1)
            }]
        );
    }

    #[test]
    fn test_lagging_follower_receives_snapshot() {
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(1),
                last_included_term: Term(1),
                configuration: vec![peer(2), peer(3)],
            },
            data: b"state".to_vec(),
        };
        let store = Arc::new(MemorySnapshotStore::with_snapshot(snapshot.clone()));
        let mut h = Harness::with_store(3, store, vec![]);
        let (b, _) = h.quorate();
        h.core.term = Term(1);
        h.core.enter(Phase::LeaderBootstrap);
        h.rpc(
            Phase::LeaderBootstrap,
            b,
            peer(2),
            ClusterView::default(),
            Rpc::InstallIndex {
                term: Term(1),
                index: LogIndex(1),
            },
        );

        let (d, _) = h.join(Phase::LeaderOperational, peer(4), vec![]);
        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::Induct { term: Term(1) },
        );
        h.sent(d);

        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::Bootstrapped {
                index: LogIndex::ZERO,
            },
        );
        assert_eq!(
            h.sent(d),
            vec![Rpc::InstallSnapshot {
                term: Term(1),
                snapshot
            }]
        );

        // restored from the snapshot, the follower is inducted
        h.rpc(
            Phase::LeaderOperational,
            d,
            peer(4),
            ClusterView::default(),
            Rpc::Bootstrapped { index: LogIndex(1) },
        );
        assert_eq!(
            h.sent(d),
            vec![Rpc::Inducted {
                term: Term(1),
                commit: LogIndex(1)
            }]
        );
    }

    #[test]
    fn test_bootstrapping_follower_installs_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut h = Harness::with_store(3, store.clone(), vec![]);
        let (b, _) = h.quorate();

        let append = Rpc::AppendEntries {
            term: Term(1),
            index: LogIndex(8),
            commit: LogIndex(8),
        };
        assert_eq!(
            h.rpc(Phase::FollowerTimer, b, peer(2), leader_view(2), append),
            Step::Transition(Phase::FollowerInductee)
        );
        h.core.enter(Phase::FollowerInductee);
        let step = h.rpc(
            Phase::FollowerInductee,
            b,
            peer(2),
            leader_view(2),
            Rpc::Bootstrap {
                term: Term(1),
                index: LogIndex(8),
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerBootstrap));
        h.core.enter(Phase::FollowerBootstrap);
        h.sent(b);

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(8),
                last_included_term: Term(1),
                configuration: vec![peer(2), peer(3), peer(4)],
            },
            data: b"state".to_vec(),
        };
        let step = h.rpc(
            Phase::FollowerBootstrap,
            b,
            peer(2),
            leader_view(2),
            Rpc::InstallSnapshot {
                term: Term(1),
                snapshot: snapshot.clone(),
            },
        );

        assert_eq!(step, Step::Stay);
        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert_eq!(h.core.last_index, LogIndex(8));
        assert!(h.core.membership.contains(&peer(4)));
        assert_eq!(h.sent(b), vec![Rpc::Bootstrapped { index: LogIndex(8) }]);
    }

    #[test]
    fn test_leader_steps_down_on_quorum_loss() {
        let mut h = Harness::new(3);
        let (b, c) = h.quorate();
        h.core.enter(Phase::LeaderBootstrap);

        assert_eq!(h.close(Phase::LeaderBootstrap, b), Step::Stay);
        assert_eq!(
            h.close(Phase::LeaderBootstrap, c),
            Step::Transition(Phase::FollowerDormant)
        );
    }

    #[test]
    fn test_leader_steps_down_for_newer_leader() {
        let mut h = Harness::new(3);
        let (b, _) = h.quorate();
        h.core.term = Term(1);
        h.core.enter(Phase::LeaderBootstrap);

        let step = h.rpc(
            Phase::LeaderBootstrap,
            b,
            peer(2),
            leader_view(2),
            Rpc::AppendEntries {
                term: Term(2),
                index: LogIndex(1),
                commit: LogIndex(1),
            },
        );
        assert_eq!(step, Step::Transition(Phase::FollowerInductee));
        assert_eq!(h.core.term, Term(2));
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut h = Harness::new(1);

        assert_eq!(
            h.core.enter(Phase::FollowerDormant),
            Step::Transition(Phase::FollowerTimer)
        );
        assert_eq!(h.core.enter(Phase::FollowerTimer), Step::Stay);
        assert_eq!(
            h.core.step(Phase::FollowerTimer, Event::ElectionTimeout),
            Step::Transition(Phase::CandidateTimer)
        );
        assert_eq!(
            h.core.enter(Phase::CandidateTimer),
            Step::Transition(Phase::LeaderBootstrap)
        );
        assert_eq!(
            h.core.enter(Phase::LeaderBootstrap),
            Step::Transition(Phase::LeaderOperational)
        );
    }

    #[test]
    fn test_dormant_dials_seeds_one_at_a_time() {
        let seeds = vec![peer(2), peer(3)];
        let mut h = Harness::with_store(3, Arc::new(MemorySnapshotStore::new()), seeds);

        assert_eq!(h.core.enter(Phase::FollowerDormant), Step::Stay);
        assert_eq!(h.dials.try_recv().unwrap(), peer(2));
        assert!(h.dials.try_recv().is_err());

        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::DialFailed { address: peer(2) }),
        );
        assert_eq!(h.dials.try_recv().unwrap(), peer(3));
    }

    #[test]
    fn test_outbound_connection_joins_membership() {
        let mut h = Harness::new(3);
        let (connection, gateway) = h.open(peer(2), Direction::Outbound);
        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );

        assert!(h.core.membership.contains(&peer(2)));
        assert_eq!(h.core.live(), 1);
        assert_eq!(h.sent(connection), vec![Rpc::Handshake]);
    }

    #[test]
    fn test_dialed_alias_is_replaced_by_advertised_address() {
        let mut h = Harness::new(3);
        let alias = Address::new("node2", 7000);
        let (connection, gateway) = h.open(alias.clone(), Direction::Outbound);
        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );

        let step = h.rpc(
            Phase::FollowerDormant,
            connection,
            peer(2),
            ClusterView::default(),
            Rpc::Handshake,
        );

        // one real peer is not a cluster of three
        assert_eq!(step, Step::Stay);
        assert_eq!(h.core.membership.members(), &[peer(2)]);
        assert_eq!(h.core.live(), 1);
        assert!(!h.core.is_quorate());
        assert_eq!(h.core.membership.view(false).members, vec![peer(2)]);
    }

    #[test]
    fn test_dial_to_own_alias_is_not_repeated() {
        let alias = Address::new("localhost", 7000);
        let mut h = Harness::with_store(3, Arc::new(MemorySnapshotStore::new()), vec![alias.clone()]);
        assert_eq!(h.core.enter(Phase::FollowerDormant), Step::Stay);
        assert_eq!(h.dials.try_recv().unwrap(), alias);

        let (connection, gateway) = h.open(alias, Direction::Outbound);
        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );
        h.rpc(
            Phase::FollowerDormant,
            connection,
            own(),
            ClusterView::default(),
            Rpc::Handshake,
        );

        assert!(h.core.membership.members().is_empty());
        assert!(!h.core.registry.contains(connection));
        assert_eq!(h.core.enter(Phase::FollowerDormant), Step::Stay);
        assert!(h.dials.try_recv().is_err());
    }

    #[test]
    fn test_operational_node_does_not_redial_alias() {
        let alias = Address::new("node2", 7000);
        let mut h = Harness::with_store(2, Arc::new(MemorySnapshotStore::new()), vec![alias.clone()]);
        assert_eq!(h.core.enter(Phase::FollowerDormant), Step::Stay);
        assert_eq!(h.dials.try_recv().unwrap(), alias);

        let (connection, gateway) = h.open(alias.clone(), Direction::Outbound);
        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );
        h.rpc(
            Phase::FollowerTimer,
            connection,
            peer(2),
            ClusterView::default(),
            Rpc::Handshake,
        );
        assert_eq!(h.core.membership.members(), &[peer(2)]);

        let step = h.core.step(Phase::FollowerOperational, Event::HeartbeatTick);
        assert_eq!(step, Step::Stay);
        assert!(h.dials.try_recv().is_err());

        // a later dial of the alias is admitted under the advertised address
        let (again, gateway) = h.open(alias, Direction::Outbound);
        h.core.step(
            Phase::FollowerOperational,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );
        assert_eq!(h.core.membership.members(), &[peer(2)]);
        assert_eq!(h.core.registry.connections_to(&peer(2)).len(), 1);
        assert!(h.core.registry.contains(again) != h.core.registry.contains(connection));
    }

    #[test]
    fn test_duplicate_connections_keep_lower_address_dial() {
        let mut h = Harness::new(3);
        let (outbound, gateway) = h.open(peer(2), Direction::Outbound);
        h.core.step(
            Phase::FollowerDormant,
            Event::Inbound(Message::AddServerRequest { gateway }),
        );

        // the peer dialed us too; we have the lower address so our dial wins
        let (inbound, _) = h.join(Phase::FollowerDormant, peer(2), vec![]);
        assert!(h.core.registry.contains(outbound));
        assert!(!h.core.registry.contains(inbound));
        assert_eq!(h.core.live(), 1);
    }

    #[test]
    fn test_gossip_grows_membership() {
        let mut h = Harness::new(3);
        let (_, step) = h.join(Phase::FollowerDormant, peer(2), vec![peer(3), peer(4), own()]);

        assert_eq!(step, Step::Stay);
        assert_eq!(h.core.membership.members(), &[peer(2), peer(3), peer(4)]);
        // below quorum, the next known member is dialed
        assert_eq!(h.dials.try_recv().unwrap(), peer(3));
    }

    #[test]
    fn test_transitions_are_deterministic() {
        fn run() -> Vec<Step> {
            let mut h = Harness::new(3);
            let mut steps = Vec::new();
            let (b, step) = h.join(Phase::FollowerDormant, peer(2), vec![peer(3)]);
            steps.push(step);
            let (_, step) = h.join(Phase::FollowerDormant, peer(3), vec![]);
            steps.push(step);
            steps.push(h.core.enter(Phase::FollowerTimer));
            steps.push(h.rpc(
                Phase::FollowerTimer,
                b,
                peer(2),
                ClusterView::default(),
                Rpc::RequestVote {
                    term: Term(1),
                    last_index: LogIndex::ZERO,
                },
            ));
            steps.push(h.core.step(Phase::FollowerTimer, Event::ElectionTimeout));
            steps
        }

        assert_eq!(run(), run());
    }
}
