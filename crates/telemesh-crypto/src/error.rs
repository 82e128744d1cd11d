//! Crypto error types

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid nonce length
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Decryption or authentication failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Handshake could not be decoded or authenticated
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The remote static key is not set yet
    #[error("Remote key not set")]
    MissingRemoteKey,

    /// No line keys have been derived yet
    #[error("No session keys established")]
    NoSessionKeys,

    /// Unknown cipher suite identifier
    #[error("Unknown cipher set: 0x{0:02x}")]
    UnknownCipherSet(u8),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
