//! Hashname Derivation
//!
//! A hashname is the 32-byte content-addressed identifier of an
//! endpoint, folded over its cipher-suite fingerprints in ascending
//! CSID order. Canonically rendered as lowercase hex.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use telemesh_crypto::{fingerprint, Keys, Parts, PublicKey};

use crate::error::{CoreError, CoreResult};

/// Hashname size in bytes
pub const HASHNAME_SIZE: usize = 32;

/// A 32-byte endpoint identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hashname {
    bytes: [u8; HASHNAME_SIZE],
}

impl Hashname {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; HASHNAME_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derive a hashname from fingerprints, checking them against keys
    ///
    /// Every key must match its fingerprint in `parts`; `parts` may
    /// carry additional CSIDs the caller has no key for.
    pub fn derive(parts: &Parts, keys: &Keys) -> CoreResult<Self> {
        if parts.is_empty() {
            return Err(CoreError::InvalidIdentity("no parts".into()));
        }

        for (csid, key) in keys {
            match parts.get(csid) {
                Some(fp) if *fp == fingerprint(key) => {}
                _ => return Err(CoreError::KeyMismatch(*csid)),
            }
        }

        Ok(Self::from_parts(parts))
    }

    /// Derive a hashname from one known key plus the full fingerprint map
    pub fn from_key_and_parts(csid: u8, key: &PublicKey, parts: &Parts) -> CoreResult<Self> {
        match parts.get(&csid) {
            Some(fp) if *fp == fingerprint(key) => Ok(Self::from_parts(parts)),
            _ => Err(CoreError::KeyMismatch(csid)),
        }
    }

    /// Fold the fingerprint map into a digest
    ///
    /// CSIDs iterate in ascending byte order (BTreeMap ordering); each
    /// round mixes `sha256(csid || fingerprint_hex)` with the previous
    /// digest.
    pub fn from_parts(parts: &Parts) -> Self {
        if parts.is_empty() {
            return Self::from_bytes([0u8; HASHNAME_SIZE]);
        }

        let mut rollup: Vec<u8> = Vec::new();

        for (csid, fp) in parts {
            let mut hasher = Sha256::new();
            hasher.update([*csid]);
            hasher.update(fp.as_bytes());
            let intermediate = hasher.finalize();

            let mut hasher = Sha256::new();
            hasher.update(intermediate);
            hasher.update(&rollup);
            rollup = hasher.finalize().to_vec();
        }

        let mut bytes = [0u8; HASHNAME_SIZE];
        bytes.copy_from_slice(&rollup);
        Self { bytes }
    }

    /// Parse the canonical lowercase hex form
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        if hex.len() != HASHNAME_SIZE * 2 {
            return Err(CoreError::InvalidIdentity(format!(
                "bad hashname length {}",
                hex.len()
            )));
        }

        let mut bytes = [0u8; HASHNAME_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| CoreError::InvalidIdentity("bad hashname hex".into()))?;
        }
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASHNAME_SIZE] {
        &self.bytes
    }

    /// Canonical lowercase hex form
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Debug for Hashname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hashname({})", self.short())
    }
}

impl std::fmt::Display for Hashname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemesh_crypto::KeyPair;

    fn keyed_parts() -> (Keys, Parts) {
        let pair_a = KeyPair::generate();
        let pair_b = KeyPair::generate();

        let mut keys = Keys::new();
        keys.insert(0x1a, pair_a.public);
        keys.insert(0x3a, pair_b.public);

        let parts: Parts = keys
            .iter()
            .map(|(csid, key)| (*csid, fingerprint(key)))
            .collect();

        (keys, parts)
    }

    #[test]
    fn test_derive_deterministic() {
        let (keys, parts) = keyed_parts();

        let a = Hashname::derive(&parts, &keys).unwrap();
        let b = Hashname::derive(&parts, &keys).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_depends_on_every_part() {
        let (keys, parts) = keyed_parts();
        let full = Hashname::derive(&parts, &keys).unwrap();

        let mut one_part = parts.clone();
        one_part.remove(&0x1a);
        let partial = Hashname::from_parts(&one_part);

        assert_ne!(full, partial);
    }

    #[test]
    fn test_derive_rejects_key_mismatch() {
        let (keys, mut parts) = keyed_parts();
        parts.insert(0x3a, "00".repeat(32));

        assert!(matches!(
            Hashname::derive(&parts, &keys),
            Err(CoreError::KeyMismatch(0x3a))
        ));
    }

    #[test]
    fn test_from_key_and_parts() {
        let (keys, parts) = keyed_parts();
        let full = Hashname::derive(&parts, &keys).unwrap();

        let single = Hashname::from_key_and_parts(0x3a, &keys[&0x3a], &parts).unwrap();
        assert_eq!(full, single);

        let wrong = KeyPair::generate();
        assert!(Hashname::from_key_and_parts(0x3a, &wrong.public, &parts).is_err());
    }

    #[test]
    fn test_hex_roundtrip() {
        let (_, parts) = keyed_parts();
        let hn = Hashname::from_parts(&parts);

        let hex = hn.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hashname::from_hex(&hex).unwrap(), hn);

        assert!(Hashname::from_hex("abc").is_err());
    }
}
