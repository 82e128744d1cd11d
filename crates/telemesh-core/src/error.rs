//! Core protocol errors

use thiserror::Error;

use crate::hashname::Hashname;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// A handshake failed decryption or authentication
    #[error("Invalid handshake")]
    InvalidHandshake,

    /// The exchange broke (no accepted response handshake in time)
    #[error("Broken exchange {0}")]
    BrokenExchange(Hashname),

    /// The exchange expired after sitting idle
    #[error("Exchange {0} expired")]
    ExchangeExpired(Hashname),

    /// No exchange exists for the requested target
    #[error("Unreachable endpoint {0}")]
    UnreachableEndpoint(Hashname),

    /// The channel is closed for this operation
    #[error("Channel closed")]
    ChannelClosed,

    /// The peer terminated the channel with an error
    #[error("Channel error from peer: {0}")]
    ChannelErr(String),

    /// The transport layer shut down
    #[error("Transport closed")]
    TransportClosed,

    /// LOB or header decode failure
    #[error("Malformed packet")]
    MalformedPacket,

    /// `parts` and `keys` disagree on a fingerprint
    #[error("Key does not match fingerprint for csid 0x{0:02x}")]
    KeyMismatch(u8),

    /// A channel type string exceeding the protocol limit
    #[error("Invalid channel type: {0:?}")]
    InvalidChannelType(String),

    /// No common cipher suite with the remote endpoint
    #[error("No common cipher set")]
    NoCommonCipherSet,

    /// Identity document could not be parsed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Configuration rejected by validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] telemesh_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    Net(#[from] telemesh_net::NetError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
