//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down
    #[error("Transport closed")]
    TransportClosed,

    /// LOB decode failure or oversized head
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Address could not be parsed or encoded
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Address already in use
    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// Gateway interaction failed
    #[error("NAT gateway error: {0}")]
    Gateway(String),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
