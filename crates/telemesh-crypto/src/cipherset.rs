//! Cipher Suite Contract
//!
//! A cipher suite (identified by a 1-byte CSID) bundles the algorithms
//! of one exchange: handshake sealing, line encryption and token
//! derivation. Suites register with a `Registry` at startup; the
//! highest CSID common to both endpoints wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::constants::TOKEN_SIZE;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey};

/// A 16-byte demux tag, stable per exchange per direction
pub type Token = [u8; TOKEN_SIZE];

/// Intermediate key fingerprints by CSID, as carried in handshakes
pub type Parts = BTreeMap<u8, String>;

/// Public keys by CSID
pub type Keys = BTreeMap<u8, PublicKey>;

/// Local keypairs by CSID
pub type LocalKeys = BTreeMap<u8, KeyPair>;

/// A decrypted (but not yet applied) handshake
#[derive(Clone)]
pub struct Handshake {
    csid: u8,
    at: u32,
    parts: Parts,
    public_key: PublicKey,
    ephemeral_key: PublicKey,
    tag: [u8; 16],
}

impl Handshake {
    /// Assemble a handshake from its decrypted fields
    pub fn new(
        csid: u8,
        at: u32,
        parts: Parts,
        public_key: PublicKey,
        ephemeral_key: PublicKey,
        tag: [u8; 16],
    ) -> Self {
        Self {
            csid,
            at,
            parts,
            public_key,
            ephemeral_key,
            tag,
        }
    }

    /// The cipher suite this handshake belongs to
    pub fn csid(&self) -> u8 {
        self.csid
    }

    /// The handshake sequence number
    pub fn at(&self) -> u32 {
        self.at
    }

    /// The sender's key fingerprints
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    /// The sender's static public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The sender's ephemeral public key
    pub fn ephemeral_key(&self) -> &PublicKey {
        &self.ephemeral_key
    }

    /// The sender's authentication tag
    pub fn tag(&self) -> &[u8; 16] {
        &self.tag
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handshake(csid=0x{:02x}, at={})", self.csid, self.at)
    }
}

/// Per-exchange cipher state
///
/// One instance lives inside each exchange and is driven only by the
/// exchange's owning task. `apply_handshake` must be idempotent: applying
/// the same handshake twice leaves the state unchanged and reports success.
pub trait CipherSet: Send {
    /// The suite identifier
    fn csid(&self) -> u8;

    /// Pin the remote static key (dial path)
    fn set_remote_key(&mut self, key: &PublicKey) -> CryptoResult<()>;

    /// Seal a handshake at the given sequence number
    fn encrypt_handshake(&mut self, at: u32, parts: &Parts) -> CryptoResult<Vec<u8>>;

    /// Authenticate and absorb a decrypted handshake
    fn apply_handshake(&mut self, handshake: &Handshake) -> bool;

    /// Encrypt an encoded inner packet into a line packet body
    fn encrypt_packet(&mut self, inner: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Decrypt a line packet body into the encoded inner packet
    fn decrypt_packet(&mut self, body: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Token identifying the local side, once known
    fn local_token(&self) -> Option<Token>;

    /// Token identifying the remote side, once known
    fn remote_token(&self) -> Option<Token>;

    /// Fixed comparison between the endpoints' static keys; the high
    /// side uses odd sequence and channel-id parity
    fn is_high(&self) -> bool;
}

/// Factory for one cipher suite
pub trait CipherSetFactory: Send + Sync {
    /// The suite identifier
    fn csid(&self) -> u8;

    /// Create fresh per-exchange state around a local keypair
    fn new_state(&self, local: &KeyPair) -> CryptoResult<Box<dyn CipherSet>>;

    /// Decrypt a handshake body addressed to the local keypair
    fn decrypt_handshake(&self, local: &KeyPair, body: &[u8]) -> CryptoResult<Handshake>;
}

/// Registry of cipher suites, keyed by CSID
pub struct Registry {
    factories: HashMap<u8, Arc<dyn CipherSetFactory>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with all built-in suites
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::cs3a::Cs3a));
        registry
    }

    /// Register a cipher suite
    pub fn register(&mut self, factory: Arc<dyn CipherSetFactory>) {
        self.factories.insert(factory.csid(), factory);
    }

    /// Look up a suite by CSID
    pub fn get(&self, csid: u8) -> Option<&Arc<dyn CipherSetFactory>> {
        self.factories.get(&csid)
    }

    /// Generate a local keypair for every registered suite
    pub fn generate_keys(&self) -> LocalKeys {
        self.factories
            .keys()
            .map(|csid| (*csid, KeyPair::generate()))
            .collect()
    }

    /// Derive the fingerprint map for a set of local keys
    pub fn parts_for(&self, keys: &LocalKeys) -> Parts {
        keys.iter()
            .map(|(csid, pair)| (*csid, fingerprint(&pair.public)))
            .collect()
    }

    /// Intersect the two key sets and pick the highest common CSID
    pub fn select_csid(&self, local: &LocalKeys, remote: &Keys) -> Option<u8> {
        local
            .keys()
            .filter(|csid| remote.contains_key(csid) && self.factories.contains_key(csid))
            .max()
            .copied()
    }

    /// Decrypt a handshake body for the given CSID
    pub fn decrypt_handshake(
        &self,
        csid: u8,
        local: &KeyPair,
        body: &[u8],
    ) -> CryptoResult<Handshake> {
        let factory = self
            .factories
            .get(&csid)
            .ok_or(CryptoError::UnknownCipherSet(csid))?;
        factory.decrypt_handshake(local, body)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Fingerprint of a public key: lowercase hex of its SHA-256 digest
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs3a::CSID_3A;

    #[test]
    fn test_select_highest_common_csid() {
        let registry = Registry::with_defaults();
        let local = registry.generate_keys();
        let remote: Keys = local.iter().map(|(c, k)| (*c, k.public)).collect();

        assert_eq!(registry.select_csid(&local, &remote), Some(CSID_3A));
    }

    #[test]
    fn test_select_csid_no_overlap() {
        let registry = Registry::with_defaults();
        let local = registry.generate_keys();
        let remote = Keys::new();

        assert_eq!(registry.select_csid(&local, &remote), None);
    }

    #[test]
    fn test_fingerprint_stable() {
        let pair = KeyPair::generate();
        let a = fingerprint(&pair.public);
        let b = fingerprint(&pair.public);

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
