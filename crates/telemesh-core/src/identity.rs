//! Endpoint Identity
//!
//! An identity is the public face of an endpoint: its keys by CSID,
//! the derived fingerprints, and any known network paths. Identities
//! are produced by parsing identity documents or by observation
//! during a handshake.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use telemesh_crypto::{fingerprint, Keys, Parts, PublicKey};
use telemesh_net::PathObject;

use crate::error::{CoreError, CoreResult};
use crate::hashname::Hashname;

/// Public identity of a (possibly remote) endpoint
#[derive(Clone, Debug)]
pub struct Identity {
    keys: Keys,
    parts: Parts,
    paths: Vec<SocketAddr>,
    hashname: Hashname,
}

/// JSON document form of an identity
#[derive(Serialize, Deserialize)]
struct IdentityDocument {
    keys: BTreeMap<String, String>,
    #[serde(default)]
    paths: Vec<PathObject>,
}

impl Identity {
    /// Build an identity from keys; fingerprints are derived
    pub fn from_keys(keys: Keys, paths: Vec<SocketAddr>) -> CoreResult<Self> {
        if keys.is_empty() {
            return Err(CoreError::InvalidIdentity("no keys".into()));
        }

        let parts: Parts = keys
            .iter()
            .map(|(csid, key)| (*csid, fingerprint(key)))
            .collect();
        let hashname = Hashname::derive(&parts, &keys)?;

        Ok(Self {
            keys,
            parts,
            paths,
            hashname,
        })
    }

    /// Build an identity from a subset key plus the full fingerprint map
    ///
    /// Used when a handshake or introduction supplies one key and the
    /// fingerprints of the rest.
    pub fn from_key_and_parts(
        csid: u8,
        key: PublicKey,
        parts: Parts,
        paths: Vec<SocketAddr>,
    ) -> CoreResult<Self> {
        let hashname = Hashname::from_key_and_parts(csid, &key, &parts)?;

        let mut keys = Keys::new();
        keys.insert(csid, key);

        Ok(Self {
            keys,
            parts,
            paths,
            hashname,
        })
    }

    /// Parse a JSON identity document
    pub fn from_json(data: &[u8]) -> CoreResult<Self> {
        let doc: IdentityDocument =
            serde_json::from_slice(data).map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;

        let mut keys = Keys::new();
        for (csid_hex, key_hex) in &doc.keys {
            let csid = u8::from_str_radix(csid_hex, 16)
                .map_err(|_| CoreError::InvalidIdentity(format!("bad csid {:?}", csid_hex)))?;
            let key_bytes = decode_hex(key_hex)
                .ok_or_else(|| CoreError::InvalidIdentity(format!("bad key for {:?}", csid_hex)))?;
            keys.insert(csid, PublicKey::try_from_slice(&key_bytes)?);
        }

        let mut paths = Vec::new();
        for path in &doc.paths {
            paths.push(path.to_addr().map_err(CoreError::Net)?);
        }

        Self::from_keys(keys, paths)
    }

    /// Serialize to a JSON identity document
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        let doc = IdentityDocument {
            keys: self
                .keys
                .iter()
                .map(|(csid, key)| (format!("{:02x}", csid), encode_hex(key.as_bytes())))
                .collect(),
            paths: self.paths.iter().map(|a| PathObject::from_addr(*a)).collect(),
        };

        serde_json::to_vec(&doc).map_err(|e| CoreError::InvalidIdentity(e.to_string()))
    }

    /// The derived hashname
    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    /// Keys by CSID
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Fingerprints by CSID
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    /// Known network paths
    pub fn paths(&self) -> &[SocketAddr] {
        &self.paths
    }

    /// Copy of this identity with the given paths
    pub fn with_paths(&self, paths: Vec<SocketAddr>) -> Self {
        Self {
            keys: self.keys.clone(),
            parts: self.parts.clone(),
            paths,
            hashname: self.hashname,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hashname)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemesh_crypto::KeyPair;

    fn sample_identity() -> Identity {
        let pair = KeyPair::generate();
        let mut keys = Keys::new();
        keys.insert(0x3a, pair.public);

        Identity::from_keys(keys, vec!["127.0.0.1:4000".parse().unwrap()]).unwrap()
    }

    #[test]
    fn test_json_roundtrip() {
        let ident = sample_identity();
        let json = ident.to_json().unwrap();
        let parsed = Identity::from_json(&json).unwrap();

        assert_eq!(parsed.hashname(), ident.hashname());
        assert_eq!(parsed.keys(), ident.keys());
        assert_eq!(parsed.paths(), ident.paths());
    }

    #[test]
    fn test_empty_keys_rejected() {
        assert!(Identity::from_keys(Keys::new(), Vec::new()).is_err());
        assert!(Identity::from_json(b"{\"keys\":{}}").is_err());
    }

    #[test]
    fn test_subset_identity_matches_full() {
        let pair = KeyPair::generate();
        let mut keys = Keys::new();
        keys.insert(0x3a, pair.public);

        let full = Identity::from_keys(keys, Vec::new()).unwrap();
        let subset = Identity::from_key_and_parts(
            0x3a,
            pair.public,
            full.parts().clone(),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(full.hashname(), subset.hashname());
    }

    #[test]
    fn test_with_paths() {
        let ident = sample_identity();
        let addr: SocketAddr = "10.1.1.1:9".parse().unwrap();

        let updated = ident.with_paths(vec![addr]);
        assert_eq!(updated.paths(), &[addr]);
        assert_eq!(updated.hashname(), ident.hashname());
    }
}
