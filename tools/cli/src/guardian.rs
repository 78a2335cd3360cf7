//! Wires the consensus server and the transport under one supervisor

use anyhow::Context;
use conclave_config::NodeConfig;
use conclave_consensus::{
    channel, start_consensus_module, Address, ConsensusConfig, ConsensusHandle, ConsensusServer,
    FileSnapshotStore, Mailbox,
};
use conclave_networking::{TransportConfig, TransportServer};
use conclave_supervisor::{
    ChildContext, ChildSpec, ExitStatus, StatusBoard, Supervisor, SupervisorStrategy,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Guardian {
    supervisor: Supervisor,
    handle: ConsensusHandle,
}

impl Guardian {
    pub fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        let consensus = config
            .consensus_config()
            .context("invalid consensus settings")?;
        let (handle, mailbox) = channel(&consensus);

        let strategy = SupervisorStrategy {
            max_retries: config.max_restarts,
            backoff: Duration::from_millis(config.restart_backoff_ms),
            ..Default::default()
        };
        let supervisor = Supervisor::new("guardian", strategy)
            .child(consensus_child(
                config.advertise_address(),
                consensus,
                mailbox,
                config.state_dir.clone(),
            ))
            .child(transport_child(config.listen_address(), handle.clone()));

        Ok(Self { supervisor, handle })
    }

    pub fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }

    pub fn statuses(&self) -> StatusBoard {
        self.supervisor.statuses()
    }

    /// Run until `shutdown` fires or the supervisor gives up
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let statuses = self.supervisor.statuses();
        let handle = self.handle;
        let announce = tokio::spawn(async move {
            while !statuses.all_ready() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let status = handle.status();
            info!(role = %status.role, state = %status.state, "Node ready");
        });

        let result = self.supervisor.run(shutdown).await;
        announce.abort();
        result.context("node supervisor stopped")
    }
}

fn consensus_child(
    own: Address,
    config: ConsensusConfig,
    mailbox: Mailbox,
    state_dir: PathBuf,
) -> ChildSpec {
    ChildSpec::new("consensus", move |ctx: ChildContext| {
        let server = ConsensusServer::new(
            own.clone(),
            config.clone(),
            mailbox.clone(),
            Arc::new(FileSnapshotStore::new(state_dir.clone())),
        );
        async move {
            let (ready, exit) = start_consensus_module(server, ctx.shutdown().clone());
            if ready.await.is_ok() {
                ctx.ready();
            }
            match exit.await {
                Ok(clean) => ExitStatus::from(clean),
                Err(e) => {
                    error!(error = %e, "Consensus task failed");
                    ExitStatus::Abnormal
                }
            }
        }
    })
}

fn transport_child(listen: SocketAddr, handle: ConsensusHandle) -> ChildSpec {
    ChildSpec::new("transport", move |ctx: ChildContext| {
        let handle = handle.clone();
        async move {
            let transport =
                match TransportServer::bind(listen, handle, TransportConfig::default()).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(%listen, error = %e, "Unable to bind transport");
                        return ExitStatus::Abnormal;
                    }
                };
            ctx.ready();
            match transport.run(ctx.shutdown().clone()).await {
                Ok(()) => ExitStatus::Clean,
                Err(e) => {
                    error!(error = %e, "Transport failed");
                    ExitStatus::Abnormal
                }
            }
        }
    })
}
