//! Telemesh Cryptographic Primitives
//!
//! This crate provides the cipher-suite layer of the telemesh overlay:
//! - Key exchange (X25519, static + ephemeral)
//! - Line encryption (ChaCha20-Poly1305)
//! - Handshake authentication (keyed BLAKE3)
//! - Key derivation (HKDF-SHA256)
//! - The `CipherSet` contract and the CSID registry

pub mod cipherset;
pub mod cs3a;
pub mod error;
pub mod keys;
pub mod symmetric;

pub use cipherset::{
    fingerprint, CipherSet, CipherSetFactory, Handshake, Keys, LocalKeys, Parts, Registry, Token,
};
pub use cs3a::{Cs3a, CSID_3A};
pub use error::{CryptoError, CryptoResult};
pub use keys::{KeyPair, PublicKey, SecretKey, SharedSecret};
pub use symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cipherset::*;
    pub use crate::cs3a::*;
    pub use crate::error::*;
    pub use crate::keys::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Exchange token size (demux tag)
    pub const TOKEN_SIZE: usize = 16;

    /// Handshake authentication tag size
    pub const HANDSHAKE_TAG_SIZE: usize = 16;
}
