//! TCP transport for the consensus core
//!
//! Peers exchange length-prefixed bincode [`Envelope`](conclave_consensus::Envelope)
//! frames over long-lived TCP connections. Every accepted or dialed
//! connection becomes a gateway pair: the core gets the
//! [`Gateway`](conclave_consensus::Gateway), and a connection task here keeps
//! the [`GatewayLink`](conclave_consensus::GatewayLink) and shuttles frames
//! in both directions until either side closes.

pub mod frame;
mod transport;

pub use frame::{encode_frame, read_frame, write_frame, DEFAULT_MAX_FRAME_LEN};
pub use transport::{TransportConfig, TransportServer};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur on a peer connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Consensus error: {0}")]
    Consensus(#[from] conclave_consensus::ConsensusError),
}
