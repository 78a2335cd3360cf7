//! Conclave cluster node

mod guardian;

use anyhow::Context;
use clap::Parser;
use conclave_config::NodeConfig;
use conclave_tracing::LogFormat;
use guardian::Guardian;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a conclave cluster node", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "CONCLAVE_CONFIG")]
    config: Option<PathBuf>,

    /// `pretty` or `json`
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    gateway_port: Option<u16>,

    #[arg(long)]
    api_port: Option<u16>,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Peer to contact while looking for a cluster; repeatable
    #[arg(long = "seed")]
    seeds: Vec<String>,

    #[arg(long)]
    min_cluster_size: Option<usize>,
}

impl Args {
    fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.gateway_port {
            config.gateway_port = port;
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if !self.seeds.is_empty() {
            config.seeds = self.seeds.clone();
        }
        if let Some(size) = self.min_cluster_size {
            config.min_cluster_size = size;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    conclave_tracing::init(args.log_format, &args.log_level);

    let config = args.node_config()?;
    config.validate().context("configuration check failed")?;
    info!(address = %config.advertise_address(), seeds = ?config.seeds, "Starting node");

    let guardian = Guardian::new(&config)?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!(error = %e, "Unable to listen for ctrl-c, shutting down"),
        }
        signal.cancel();
    });

    guardian.run(shutdown).await
}
