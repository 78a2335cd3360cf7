//! Consensus server and its handles
//!
//! The server owns the authoritative (role, state) pair and runs exactly one
//! behavior at a time through a setup, operate, teardown cycle. Each behavior
//! owns its timers, so tearing it down cancels everything it armed.
//!
//! The channels into the server are created once by [`channel`] and outlive
//! any single server: after a crash the guardian builds a fresh
//! [`ConsensusServer`] on the same [`Mailbox`] and the transport keeps using
//! its [`ConsensusHandle`].

use crate::behavior::{Core, Event, Step};
use crate::capability::Capability;
use crate::config::{ConsensusConfig, OverflowPolicy};
use crate::gateway::{Direction, Gateway, GatewayLink};
use crate::rpc::Message;
use crate::snapshot::SnapshotStore;
use crate::state::{NodeStatus, Phase, Role, State};
use crate::types::{Address, ConnectionId};
use crate::{ConsensusError, Result};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Create the channels shared by the transport and every server incarnation
pub fn channel(config: &ConsensusConfig) -> (ConsensusHandle, Mailbox) {
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
    let (dial_tx, dial_rx) = mpsc::channel(config.inbound_capacity);
    let status = Arc::new(RwLock::new(NodeStatus::default()));

    let handle = ConsensusHandle {
        inbound: inbound_tx,
        dials: DialRequests {
            rx: Arc::new(Mutex::new(dial_rx)),
        },
        status: status.clone(),
        next_connection: Arc::new(AtomicU64::new(1)),
        outbound_capacity: config.outbound_capacity,
        overflow: config.overflow,
    };
    let mailbox = Mailbox {
        inbound: Arc::new(Mutex::new(inbound_rx)),
        dials: dial_tx,
        status,
    };
    (handle, mailbox)
}

/// Server side of the shared channels
#[derive(Clone)]
pub struct Mailbox {
    inbound: Arc<Mutex<mpsc::Receiver<Message>>>,
    dials: mpsc::Sender<Address>,
    status: Arc<RwLock<NodeStatus>>,
}

/// Addresses the core wants the transport to connect to
#[derive(Clone)]
pub struct DialRequests {
    rx: Arc<Mutex<mpsc::Receiver<Address>>>,
}

impl DialRequests {
    /// Next address to dial; `None` once every mailbox is gone
    pub async fn next(&self) -> Option<Address> {
        self.rx.lock().await.recv().await
    }
}

/// Transport and API side of the shared channels
#[derive(Clone)]
pub struct ConsensusHandle {
    inbound: mpsc::Sender<Message>,
    dials: DialRequests,
    status: Arc<RwLock<NodeStatus>>,
    next_connection: Arc<AtomicU64>,
    outbound_capacity: usize,
    overflow: OverflowPolicy,
}

impl ConsensusHandle {
    /// Create both ends of a new peer connection
    ///
    /// The [`Gateway`] must be handed to the core with
    /// [`handle_connection`](Self::handle_connection); the transport keeps
    /// the [`GatewayLink`].
    pub fn open_gateway(&self, address: Address, direction: Direction) -> (Gateway, GatewayLink) {
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        Gateway::open(
            connection,
            address,
            direction,
            self.inbound.clone(),
            self.outbound_capacity,
            self.overflow,
        )
    }

    /// Hand a freshly established connection to the core
    pub async fn handle_connection(&self, gateway: Gateway) -> Result<()> {
        self.inbound
            .send(Message::AddServerRequest { gateway })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)
    }

    /// Tell the core a requested dial did not succeed
    pub async fn report_dial_failure(&self, address: Address) -> Result<()> {
        self.inbound
            .send(Message::DialFailed { address })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)
    }

    pub fn dial_requests(&self) -> DialRequests {
        self.dials.clone()
    }

    /// Role, state and membership as of the last processed event
    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    /// Fail unless the current phase holds `capability`
    pub fn ensure(&self, capability: Capability) -> Result<()> {
        self.status.read().ensure(capability)
    }
}

/// The behavior currently installed, with the timers it armed
struct ActiveBehavior {
    phase: Phase,
    election_timeout: Option<Duration>,
    election: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl ActiveBehavior {
    fn setup(role: Role, state: State, config: &ConsensusConfig, rng: &mut StdRng) -> Result<Self> {
        let phase = Phase::from_pair(role, state)?;
        let capabilities = phase.capabilities();

        let election_timeout = capabilities
            .contains(Capability::Time)
            .then(|| rng.gen_range(config.election_timeout_min..config.election_timeout_max));

        let heartbeat = (role == Role::Leader && capabilities.contains(Capability::Heartbeat))
            .then(|| {
                let period = config.heartbeat_interval;
                let mut heartbeat = interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                heartbeat
            });

        info!(%phase, %capabilities, ?election_timeout, "Behavior installed");
        Ok(Self {
            phase,
            election_timeout,
            election: election_timeout.map(|timeout| Box::pin(sleep(timeout))),
            heartbeat,
        })
    }

    fn reset_election(&mut self) {
        if let Some(timeout) = self.election_timeout {
            self.election = Some(Box::pin(sleep(timeout)));
        }
    }

    /// Process events until the phase ends; `None` means shutdown
    async fn operate(
        &mut self,
        core: &mut Core,
        inbound: &mut mpsc::Receiver<Message>,
        shutdown: &CancellationToken,
        status: &RwLock<NodeStatus>,
    ) -> Option<Phase> {
        let mut step = core.enter(self.phase);

        loop {
            publish(status, core, self.phase);
            match step {
                Step::Transition(next) => return Some(next),
                Step::ResetElectionTimer => self.reset_election(),
                Step::Stay => {}
            }

            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                message = inbound.recv() => match message {
                    Some(message) => Event::Inbound(message),
                    None => return None,
                },
                _ = election_fired(&mut self.election) => Event::ElectionTimeout,
                _ = heartbeat_due(&mut self.heartbeat) => Event::HeartbeatTick,
            };
            if let Event::ElectionTimeout = event {
                self.election = None;
            }

            step = core.step(self.phase, event);
        }
    }

    fn teardown(self) {
        debug!(phase = %self.phase, "Behavior torn down");
    }
}

async fn election_fired(election: &mut Option<Pin<Box<Sleep>>>) {
    match election {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_due(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn publish(status: &RwLock<NodeStatus>, core: &Core, phase: Phase) {
    let live = core.live();
    *status.write() = NodeStatus {
        role: phase.role(),
        state: phase.state(),
        capabilities: phase.capabilities(),
        term: core.term,
        leader: core.leader(phase),
        members: core.membership.members().to_vec(),
        live_peers: live,
    };
    metrics::gauge!("conclave_live_peers").set(live as f64);
}

/// The consensus state machine of one node
pub struct ConsensusServer {
    config: ConsensusConfig,
    core: Core,
    role: Role,
    state: State,
    mailbox: Mailbox,
    rng: StdRng,
    started: bool,
    ready: Option<oneshot::Sender<()>>,
}

impl ConsensusServer {
    pub fn new(
        address: Address,
        config: ConsensusConfig,
        mailbox: Mailbox,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let rng = match config.election_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let core = Core::new(address, &config, mailbox.dials.clone(), snapshots);

        Self {
            config,
            core,
            role: Role::Follower,
            state: State::Dormant,
            mailbox,
            rng,
            started: false,
            ready: None,
        }
    }

    pub fn address(&self) -> &Address {
        self.core.membership.own()
    }

    /// Run until `shutdown` fires or a behavior cannot be installed
    ///
    /// A second call returns immediately.
    pub async fn start(&mut self, shutdown: CancellationToken) -> Result<()> {
        if self.started {
            debug!("Consensus server already started");
            return Ok(());
        }
        self.started = true;

        let inbound = Arc::clone(&self.mailbox.inbound);
        let mut inbound = inbound.lock().await;

        info!(address = %self.address(), "Consensus server starting");
        let result = self.run(&mut inbound, &shutdown).await;

        self.core.registry.close_all();
        info!(address = %self.address(), "Consensus server stopped");
        result
    }

    async fn run(
        &mut self,
        inbound: &mut mpsc::Receiver<Message>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let mut behavior =
                ActiveBehavior::setup(self.role, self.state, &self.config, &mut self.rng)?;
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }

            let next = behavior
                .operate(&mut self.core, inbound, shutdown, &self.mailbox.status)
                .await;
            let current = behavior.phase;
            behavior.teardown();

            let Some(next) = next else {
                return Ok(());
            };
            info!(from = %current, to = %next, term = %self.core.term, "Transition");
            metrics::counter!("conclave_transitions_total", "to" => next.to_string()).increment(1);

            self.role = next.role();
            self.state = next.state();
        }
    }
}

/// Start the consensus server on its own task
///
/// The receiver resolves once the initial behavior is installed. The join
/// handle yields `true` on a clean exit and `false` if the server failed.
pub fn start_consensus_module(
    mut server: ConsensusServer,
    shutdown: CancellationToken,
) -> (oneshot::Receiver<()>, JoinHandle<bool>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    server.ready = Some(ready_tx);

    let exit = tokio::spawn(async move {
        match server.start(shutdown).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Consensus server failed");
                false
            }
        }
    });
    (ready_rx, exit)
}
