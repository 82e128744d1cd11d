//! Cipher Suite 0x3a
//!
//! X25519 static + ephemeral Diffie-Hellman, ChaCha20-Poly1305 line
//! encryption, keyed-BLAKE3 handshake authentication and HKDF-SHA256
//! key derivation.
//!
//! Handshake body: `ephemeral_pub(32) || nonce(12) || sealed(inner)`.
//! Line packet body: `remote_token(16) || nonce(12) || sealed(inner)`.

use serde::{Deserialize, Serialize};

use crate::cipherset::{CipherSet, CipherSetFactory, Handshake, Parts, Token};
use crate::constants::{NONCE_SIZE, TOKEN_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey};
use crate::symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// CSID of this suite
pub const CSID_3A: u8 = 0x3a;

const HANDSHAKE_INFO: &[u8] = b"telemesh:cs3a:handshake";
const HANDSHAKE_AUTH_INFO: &[u8] = b"telemesh:cs3a:handshake:auth";
const LINE_INFO: &[u8] = b"telemesh:cs3a:line";

/// Factory for CS 0x3a
pub struct Cs3a;

impl CipherSetFactory for Cs3a {
    fn csid(&self) -> u8 {
        CSID_3A
    }

    fn new_state(&self, local: &KeyPair) -> CryptoResult<Box<dyn CipherSet>> {
        Ok(Box::new(Cs3aState::new(local.clone())))
    }

    fn decrypt_handshake(&self, local: &KeyPair, body: &[u8]) -> CryptoResult<Handshake> {
        if body.len() < X25519_KEY_SIZE + NONCE_SIZE {
            return Err(CryptoError::InvalidHandshake("handshake too short".into()));
        }

        let ephemeral = PublicKey::try_from_slice(&body[..X25519_KEY_SIZE])?;
        let nonce = Nonce::try_from_slice(&body[X25519_KEY_SIZE..X25519_KEY_SIZE + NONCE_SIZE])?;
        let sealed = &body[X25519_KEY_SIZE + NONCE_SIZE..];

        let key = SymmetricKey::from_bytes(
            local
                .secret
                .diffie_hellman(&ephemeral)
                .derive_key(HANDSHAKE_INFO),
        );
        let plaintext = decrypt(&key, &nonce, sealed)
            .map_err(|_| CryptoError::InvalidHandshake("handshake seal rejected".into()))?;

        let inner: HandshakeInner = bincode::deserialize(&plaintext)
            .map_err(|e| CryptoError::InvalidHandshake(e.to_string()))?;

        Ok(Handshake::new(
            CSID_3A,
            inner.at,
            inner.parts,
            PublicKey::from_bytes(inner.static_key),
            ephemeral,
            inner.tag,
        ))
    }
}

/// Sealed handshake payload
#[derive(Serialize, Deserialize)]
struct HandshakeInner {
    at: u32,
    parts: Parts,
    static_key: [u8; X25519_KEY_SIZE],
    tag: [u8; 16],
}

/// Per-exchange state for CS 0x3a
struct Cs3aState {
    local: KeyPair,
    ephemeral: KeyPair,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    send_key: Option<SymmetricKey>,
    recv_key: Option<SymmetricKey>,
}

impl Cs3aState {
    fn new(local: KeyPair) -> Self {
        Self {
            local,
            ephemeral: KeyPair::generate(),
            remote_static: None,
            remote_ephemeral: None,
            send_key: None,
            recv_key: None,
        }
    }

    /// Tag binding the sender's ephemeral and sequence to the static-static secret
    fn auth_tag(&self, remote_static: &PublicKey, ephemeral: &PublicKey, at: u32) -> [u8; 16] {
        let key = self
            .local
            .secret
            .diffie_hellman(remote_static)
            .derive_key(HANDSHAKE_AUTH_INFO);

        let mut data = [0u8; X25519_KEY_SIZE + 4];
        data[..X25519_KEY_SIZE].copy_from_slice(ephemeral.as_bytes());
        data[X25519_KEY_SIZE..].copy_from_slice(&at.to_be_bytes());

        let digest = blake3::keyed_hash(&key, &data);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&digest.as_bytes()[..16]);
        tag
    }
}

impl CipherSet for Cs3aState {
    fn csid(&self) -> u8 {
        CSID_3A
    }

    fn set_remote_key(&mut self, key: &PublicKey) -> CryptoResult<()> {
        match self.remote_static {
            Some(existing) if existing != *key => Err(CryptoError::InvalidPublicKey),
            _ => {
                self.remote_static = Some(*key);
                self.send_key = Some(SymmetricKey::from_bytes(
                    self.ephemeral
                        .secret
                        .diffie_hellman(key)
                        .derive_key(LINE_INFO),
                ));
                Ok(())
            }
        }
    }

    fn encrypt_handshake(&mut self, at: u32, parts: &Parts) -> CryptoResult<Vec<u8>> {
        let remote = self.remote_static.ok_or(CryptoError::MissingRemoteKey)?;

        let inner = HandshakeInner {
            at,
            parts: parts.clone(),
            static_key: self.local.public.to_bytes(),
            tag: self.auth_tag(&remote, &self.ephemeral.public, at),
        };
        let plaintext =
            bincode::serialize(&inner).map_err(|e| CryptoError::SerializationError(e.to_string()))?;

        let key = SymmetricKey::from_bytes(
            self.ephemeral
                .secret
                .diffie_hellman(&remote)
                .derive_key(HANDSHAKE_INFO),
        );
        let nonce = Nonce::generate();
        let sealed = encrypt(&key, &nonce, &plaintext)?;

        let mut body = Vec::with_capacity(X25519_KEY_SIZE + NONCE_SIZE + sealed.len());
        body.extend_from_slice(self.ephemeral.public.as_bytes());
        body.extend_from_slice(nonce.as_bytes());
        body.extend_from_slice(&sealed);
        Ok(body)
    }

    fn apply_handshake(&mut self, handshake: &Handshake) -> bool {
        if handshake.csid() != CSID_3A {
            return false;
        }

        // A pinned remote key must match the one in the handshake
        if let Some(existing) = self.remote_static {
            if existing != *handshake.public_key() {
                return false;
            }
        }

        let expected = self.auth_tag(
            handshake.public_key(),
            handshake.ephemeral_key(),
            handshake.at(),
        );
        if &expected != handshake.tag() {
            return false;
        }

        self.remote_static = Some(*handshake.public_key());
        self.remote_ephemeral = Some(*handshake.ephemeral_key());

        self.recv_key = Some(SymmetricKey::from_bytes(
            self.local
                .secret
                .diffie_hellman(handshake.ephemeral_key())
                .derive_key(LINE_INFO),
        ));
        self.send_key = Some(SymmetricKey::from_bytes(
            self.ephemeral
                .secret
                .diffie_hellman(handshake.public_key())
                .derive_key(LINE_INFO),
        ));

        true
    }

    fn encrypt_packet(&mut self, inner: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.send_key.as_ref().ok_or(CryptoError::NoSessionKeys)?;
        let token = self.remote_token().ok_or(CryptoError::NoSessionKeys)?;

        let nonce = Nonce::generate();
        let sealed = encrypt(key, &nonce, inner)?;

        let mut body = Vec::with_capacity(TOKEN_SIZE + NONCE_SIZE + sealed.len());
        body.extend_from_slice(&token);
        body.extend_from_slice(nonce.as_bytes());
        body.extend_from_slice(&sealed);
        Ok(body)
    }

    fn decrypt_packet(&mut self, body: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.recv_key.as_ref().ok_or(CryptoError::NoSessionKeys)?;

        if body.len() < TOKEN_SIZE + NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let nonce = Nonce::try_from_slice(&body[TOKEN_SIZE..TOKEN_SIZE + NONCE_SIZE])?;
        decrypt(key, &nonce, &body[TOKEN_SIZE + NONCE_SIZE..])
    }

    fn local_token(&self) -> Option<Token> {
        Some(token_for(&self.ephemeral.public))
    }

    fn remote_token(&self) -> Option<Token> {
        self.remote_ephemeral.as_ref().map(token_for)
    }

    fn is_high(&self) -> bool {
        match self.remote_static {
            Some(remote) => self.local.public.as_bytes() > remote.as_bytes(),
            None => false,
        }
    }
}

/// Token of an ephemeral key: first 16 bytes of its BLAKE3 digest
fn token_for(key: &PublicKey) -> Token {
    let digest = blake3::hash(key.as_bytes());
    let mut token = [0u8; TOKEN_SIZE];
    token.copy_from_slice(&digest.as_bytes()[..TOKEN_SIZE]);
    token
}
