//! Restart supervision for long-running node units
//!
//! A [`Supervisor`] owns a set of children, each started from a
//! [`ChildSpec`]. When a child exits abnormally (an error or a panic) it is
//! restarted after a backoff, up to a retry limit. The restart strategy
//! decides what else happens:
//!
//! - [`RestartStrategy::OneForOne`] restarts only the failed child.
//! - [`RestartStrategy::AllForOne`] stops every child and restarts them all.
//! - [`RestartStrategy::Escalate`] stops every child and fails the supervisor.
//!
//! Clean exits are never restarted. The supervisor returns once every child
//! is done.

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor {0} has no children")]
    NoChildren(String),

    #[error("Child {child} escalated its failure")]
    Escalated { child: String },

    #[error("Gave up restarting: {}", children.join(", "))]
    GaveUp { children: Vec<String> },
}

/// How a supervisor reacts to an abnormal exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartStrategy {
    #[default]
    OneForOne,
    AllForOne,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStrategy {
    /// Restarts allowed per child
    pub max_retries: u32,
    pub backoff: Duration,
    pub restart: RestartStrategy,
}

impl Default for SupervisorStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(500),
            restart: RestartStrategy::OneForOne,
        }
    }
}

/// Per-child replacements for the supervisor's strategy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyOverrides {
    pub max_retries: Option<u32>,
    pub backoff: Option<Duration>,
    pub restart: Option<RestartStrategy>,
}

impl SupervisorStrategy {
    pub fn merge(&self, overrides: &StrategyOverrides) -> SupervisorStrategy {
        SupervisorStrategy {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            restart: overrides.restart.unwrap_or(self.restart),
        }
    }
}

/// How a child run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Abnormal,
}

impl From<bool> for ExitStatus {
    fn from(clean: bool) -> Self {
        if clean {
            ExitStatus::Clean
        } else {
            ExitStatus::Abnormal
        }
    }
}

/// Observable state of one child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildStatus {
    pub restarts: u32,
    pub running: bool,
    pub ready: bool,
    pub done: bool,
    pub last_exit: Option<ExitStatus>,
}

/// Shared view of every child's status
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<DashMap<String, ChildStatus>>);

impl StatusBoard {
    pub fn get(&self, child: &str) -> Option<ChildStatus> {
        self.0.get(child).map(|status| status.clone())
    }

    pub fn all_ready(&self) -> bool {
        self.0.iter().all(|entry| entry.ready)
    }

    fn update(&self, child: &str, f: impl FnOnce(&mut ChildStatus)) {
        f(self.0.entry(child.to_string()).or_default().value_mut());
    }
}

/// Handed to a child each time it starts
pub struct ChildContext {
    name: String,
    shutdown: CancellationToken,
    statuses: StatusBoard,
}

impl ChildContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fires when the child must stop
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Mark this run of the child as ready
    pub fn ready(&self) {
        self.statuses.update(&self.name, |status| status.ready = true);
        info!(child = %self.name, "Child ready");
    }
}

pub type ChildFuture = Pin<Box<dyn Future<Output = ExitStatus> + Send>>;
type StartFn = Arc<dyn Fn(ChildContext) -> ChildFuture + Send + Sync>;

pub struct ChildSpec {
    name: String,
    start: StartFn,
    overrides: StrategyOverrides,
}

impl ChildSpec {
    pub fn new<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: Fn(ChildContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExitStatus> + Send + 'static,
    {
        Self {
            name: name.into(),
            start: Arc::new(move |ctx| Box::pin(start(ctx))),
            overrides: StrategyOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: StrategyOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

type Exit = (usize, u64, ExitStatus);

pub struct Supervisor {
    name: String,
    strategy: SupervisorStrategy,
    children: Vec<ChildSpec>,
    statuses: StatusBoard,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, strategy: SupervisorStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            children: Vec::new(),
            statuses: StatusBoard::default(),
        }
    }

    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn statuses(&self) -> StatusBoard {
        self.statuses.clone()
    }

    /// Run every child until all are done or `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.children.is_empty() {
            return Err(SupervisorError::NoChildren(self.name));
        }

        let strategies: Vec<_> = self
            .children
            .iter()
            .map(|child| self.strategy.merge(&child.overrides))
            .collect();
        for child in &self.children {
            self.statuses.update(&child.name, |status| *status = ChildStatus::default());
        }

        info!(supervisor = %self.name, children = self.children.len(), "Supervisor starting");
        let mut tasks = JoinSet::new();
        let mut generation = 0;
        let mut members = shutdown.child_token();
        for idx in 0..self.children.len() {
            self.spawn(&mut tasks, idx, generation, &members, Duration::ZERO);
        }

        let mut restart_all: Option<Duration> = None;
        let mut escalated: Option<String> = None;
        let mut gave_up = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let (idx, exited_in, exit) = match joined {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(supervisor = %self.name, error = %e, "Child task lost");
                    continue;
                }
            };
            let name = &self.children[idx].name;
            let strategy = &strategies[idx];
            self.statuses.update(name, |status| {
                status.running = false;
                status.ready = false;
                status.last_exit = Some(exit);
            });

            // exits from a generation that was stopped for an all-for-one restart
            if exited_in != generation {
                if tasks.is_empty() {
                    if let Some(backoff) = restart_all.take() {
                        for idx in 0..self.children.len() {
                            self.spawn(&mut tasks, idx, generation, &members, backoff);
                        }
                    }
                }
                continue;
            }

            if exit == ExitStatus::Clean || shutdown.is_cancelled() || escalated.is_some() {
                info!(child = %name, ?exit, "Child finished");
                self.statuses.update(name, |status| status.done = true);
                continue;
            }

            if strategy.restart == RestartStrategy::Escalate {
                error!(child = %name, "Child failed, escalating");
                self.statuses.update(name, |status| status.done = true);
                escalated = Some(name.clone());
                members.cancel();
                continue;
            }

            let restarts = self.statuses.get(name).map_or(0, |status| status.restarts);
            if restarts >= strategy.max_retries {
                error!(child = %name, restarts, "Child failed too often, giving up");
                self.statuses.update(name, |status| status.done = true);
                gave_up.push(name.clone());
                continue;
            }

            warn!(child = %name, attempt = restarts + 1, backoff = ?strategy.backoff, "Restarting child");
            self.statuses.update(name, |status| status.restarts += 1);
            metrics::counter!("conclave_restarts_total", "child" => name.clone()).increment(1);

            match strategy.restart {
                RestartStrategy::AllForOne => {
                    generation += 1;
                    members.cancel();
                    members = shutdown.child_token();
                    if tasks.is_empty() {
                        for idx in 0..self.children.len() {
                            self.spawn(&mut tasks, idx, generation, &members, strategy.backoff);
                        }
                    } else {
                        restart_all = Some(strategy.backoff);
                    }
                }
                _ => self.spawn(&mut tasks, idx, generation, &members, strategy.backoff),
            }
        }

        info!(supervisor = %self.name, "Supervisor stopped");
        if let Some(child) = escalated {
            return Err(SupervisorError::Escalated { child });
        }
        if !gave_up.is_empty() {
            return Err(SupervisorError::GaveUp { children: gave_up });
        }
        Ok(())
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Exit>,
        idx: usize,
        generation: u64,
        members: &CancellationToken,
        backoff: Duration,
    ) {
        let child = &self.children[idx];
        let name = child.name.clone();
        let start = child.start.clone();
        let statuses = self.statuses.clone();
        let members = members.clone();

        tasks.spawn(async move {
            if !backoff.is_zero() {
                tokio::select! {
                    _ = members.cancelled() => return (idx, generation, ExitStatus::Clean),
                    _ = sleep(backoff) => {}
                }
            }

            statuses.update(&name, |status| {
                status.running = true;
                status.done = false;
            });
            let ctx = ChildContext {
                name: name.clone(),
                shutdown: members.child_token(),
                statuses,
            };

            // run on its own task so a panic is reported as an abnormal exit
            let exit = match tokio::spawn(start(ctx)).await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(child = %name, error = %e, "Child panicked");
                    ExitStatus::Abnormal
                }
            };
            (idx, generation, exit)
        });
    }
}
