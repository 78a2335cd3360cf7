//! Three consensus servers wired together in memory
//!
//! Each pair of nodes shares one connection whose frames are shuttled by a
//! pump task, so the example needs no sockets. The nodes discover each other,
//! become quorate and elect a leader.
//!
//! Run with: cargo run --example in_memory_cluster

use conclave_consensus::{
    channel, start_consensus_module, Address, ConsensusConfigBuilder, ConsensusHandle,
    ConsensusServer, Direction, GatewayLink, MemorySnapshotStore, Role, State,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn address(n: u8) -> Address {
    Address::new(format!("127.0.0.{n}"), 7000)
}

async fn pump(from: Arc<GatewayLink>, to: Arc<GatewayLink>) {
    while let Some(envelope) = from.next_outbound().await {
        if to.deliver(envelope).await.is_err() {
            break;
        }
    }
}

async fn connect(
    dialer: (&ConsensusHandle, u8),
    listener: (&ConsensusHandle, u8),
) -> conclave_consensus::Result<()> {
    let (outbound, out_link) = dialer.0.open_gateway(address(listener.1), Direction::Outbound);
    let (inbound, in_link) = listener
        .0
        .open_gateway(Address::new(format!("127.0.0.{}", dialer.1), 40000), Direction::Inbound);
    dialer.0.handle_connection(outbound).await?;
    listener.0.handle_connection(inbound).await?;

    let (out_link, in_link) = (Arc::new(out_link), Arc::new(in_link));
    tokio::spawn(pump(out_link.clone(), in_link.clone()));
    tokio::spawn(pump(in_link, out_link));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    conclave_tracing::init(conclave_tracing::LogFormat::Pretty, "info");

    println!("=== Conclave in-memory cluster ===\n");
    let shutdown = CancellationToken::new();
    let mut nodes = Vec::new();

    for n in 1..=3 {
        let config = ConsensusConfigBuilder::new()
            .election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .heartbeat_interval(Duration::from_millis(50))
            .min_cluster_size(3)
            .build();
        let (handle, mailbox) = channel(&config);
        let server = ConsensusServer::new(
            address(n),
            config,
            mailbox,
            Arc::new(MemorySnapshotStore::new()),
        );
        let (ready, exit) = start_consensus_module(server, shutdown.clone());
        ready.await?;
        println!("  started {}", address(n));
        nodes.push((handle, exit));
    }

    connect((&nodes[0].0, 1), (&nodes[1].0, 2)).await?;
    connect((&nodes[0].0, 1), (&nodes[2].0, 3)).await?;
    connect((&nodes[1].0, 2), (&nodes[2].0, 3)).await?;

    println!("\nWaiting for a leader...");
    for _ in 0..100 {
        let settled = nodes.iter().all(|(handle, _)| handle.status().state == State::Operational);
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for (handle, _) in &nodes {
        let status = handle.status();
        let marker = if status.role == Role::Leader { "*" } else { " " };
        println!(
            " {marker} {:?} {:?} term {} leader {:?} live peers {}",
            status.role, status.state, status.term, status.leader, status.live_peers
        );
    }

    println!("\nShutting down...");
    shutdown.cancel();
    for (_, exit) in nodes {
        exit.await?;
    }
    println!("  all nodes stopped");
    Ok(())
}
