//! Accept loop, dialer and per-connection tasks

use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_LEN};
use crate::Result;
use conclave_consensus::{Address, ConsensusHandle, Direction, GatewayLink};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest accepted frame payload
    pub max_frame_len: usize,

    /// Give up on an outbound connection attempt after this long
    pub dial_timeout: Duration,

    /// Pause before reporting a failed dial, so the core does not retry the
    /// same address in a tight loop
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            dial_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// TCP front end of one node
pub struct TransportServer {
    listener: TcpListener,
    handle: ConsensusHandle,
    config: TransportConfig,
}

impl TransportServer {
    pub async fn bind(
        addr: SocketAddr,
        handle: ConsensusHandle,
        config: TransportConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Transport listening");
        Ok(Self {
            listener,
            handle,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept peers and serve dial requests until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let shutdown = shutdown.child_token();
        let dialer = tokio::spawn(dial_loop(
            self.handle.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        let result = loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            debug!(%remote, "Accepted connection");
            let (gateway, link) = self
                .handle
                .open_gateway(Address::from(remote), Direction::Inbound);
            if let Err(e) = self.handle.handle_connection(gateway).await {
                break Err(e.into());
            }
            metrics::counter!("conclave_connections_total", "direction" => "inbound").increment(1);
            spawn_connection(stream, link, self.config.max_frame_len, shutdown.clone());
        };

        shutdown.cancel();
        if let Err(e) = dialer.await {
            warn!(error = %e, "Dialer task failed");
        }
        result
    }
}

async fn dial_loop(handle: ConsensusHandle, config: TransportConfig, shutdown: CancellationToken) {
    let requests = handle.dial_requests();
    loop {
        let address = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = requests.next() => match next {
                Some(address) => address,
                None => return,
            },
        };
        tokio::spawn(dial(
            handle.clone(),
            address,
            config.clone(),
            shutdown.clone(),
        ));
    }
}

async fn dial(
    handle: ConsensusHandle,
    address: Address,
    config: TransportConfig,
    shutdown: CancellationToken,
) {
    let connect = TcpStream::connect((address.host.as_str(), address.port));
    let error = match timeout(config.dial_timeout, connect).await {
        Ok(Ok(stream)) => {
            info!(peer = %address, "Connected to peer");
            let (gateway, link) = handle.open_gateway(address, Direction::Outbound);
            if handle.handle_connection(gateway).await.is_ok() {
                metrics::counter!("conclave_connections_total", "direction" => "outbound")
                    .increment(1);
                spawn_connection(stream, link, config.max_frame_len, shutdown);
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => "timed out".to_string(),
    };

    debug!(peer = %address, error = %error, "Dial failed");
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = sleep(config.retry_delay) => {}
    }
    if handle.report_dial_failure(address).await.is_err() {
        debug!("Core gone before dial failure was reported");
    }
}

fn spawn_connection(
    stream: TcpStream,
    link: GatewayLink,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let connection = link.connection();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%connection, error = %e, "Unable to set TCP_NODELAY");
        }
        let (mut reader, mut writer) = stream.into_split();

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = read_loop(&mut reader, &link, max_frame_len) => result,
            result = write_loop(&mut writer, &link, max_frame_len) => result,
        };
        match result {
            Ok(()) => debug!(%connection, "Connection closed"),
            Err(e) => warn!(%connection, error = %e, "Connection failed"),
        }
        link.close().await;
    });
}

async fn read_loop(reader: &mut OwnedReadHalf, link: &GatewayLink, max_frame_len: usize) -> Result<()> {
    while let Some(envelope) = read_frame(reader, max_frame_len).await? {
        link.deliver(envelope).await?;
    }
    Ok(())
}

async fn write_loop(writer: &mut OwnedWriteHalf, link: &GatewayLink, max_frame_len: usize) -> Result<()> {
    while let Some(envelope) = link.next_outbound().await {
        write_frame(writer, &envelope, max_frame_len).await?;
    }
    Ok(())
}
