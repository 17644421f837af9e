//! Identity and discovery keys
//!
//! Two independent X25519 key pairs are involved in path management:
//!
//! ```text
//! NodePrivate/NodePublic   long-term identity, names a peer everywhere
//! DiscoPrivate/DiscoPublic per-process discovery key, only seals disco
//!                          control messages (Ping/Pong/CallMeMaybe)
//! ```
//!
//! Disco messages between two nodes are sealed with [`DiscoShared`], a
//! ChaCha20-Poly1305 key derived from the X25519 agreement of both disco
//! keys through HKDF-SHA256.

use std::fmt;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Error;

// ============================================================================
// Constants
// ============================================================================

/// Length of every public and private key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the random nonce prefixed to a sealed box
pub const NONCE_LEN: usize = aead::NONCE_LEN;

/// Overhead added by sealing (nonce + tag)
pub const SEAL_OVERHEAD: usize = NONCE_LEN + 16;

const DISCO_HKDF_SALT: &[u8] = b"pathsock disco v1";
const DISCO_HKDF_INFO: &[u8] = b"disco box";

// ============================================================================
// Node keys
// ============================================================================

/// Public identity key of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePublic([u8; KEY_LEN]);

impl NodePublic {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Parse the untyped lowercase hex form produced by `to_hex`.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidKey(s.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form used in logs, e.g. `[1a2b3c4d]`
    pub fn short_string(&self) -> String {
        format!("[{}]", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublic{}", self.short_string())
    }
}

/// Private identity key of this node
///
/// The all-zero key means "no key": it is what the control plane hands us
/// when the node is logged out.
#[derive(Clone, PartialEq, Eq)]
pub struct NodePrivate([u8; KEY_LEN]);

impl NodePrivate {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng).to_bytes())
    }

    pub const fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    pub fn public(&self) -> NodePublic {
        let secret = StaticSecret::from(self.0);
        NodePublic(PublicKey::from(&secret).to_bytes())
    }
}

impl fmt::Debug for NodePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "NodePrivate(zero)")
        } else {
            write!(f, "NodePrivate({})", self.public().short_string())
        }
    }
}

// ============================================================================
// Disco keys
// ============================================================================

/// Public discovery key of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoPublic([u8; KEY_LEN]);

impl DiscoPublic {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Short form used in logs, e.g. `d:1a2b3c4d`
    pub fn short_string(&self) -> String {
        format!("d:{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for DiscoPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoPublic({})", self.short_string())
    }
}

/// Private discovery key, regenerated every process start
pub struct DiscoPrivate(StaticSecret);

impl DiscoPrivate {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    pub fn public(&self) -> DiscoPublic {
        DiscoPublic(PublicKey::from(&self.0).to_bytes())
    }

    /// Derive the box key shared with `peer`.
    pub fn shared(&self, peer: &DiscoPublic) -> Result<DiscoShared, Error> {
        let dh = self.0.diffie_hellman(&PublicKey::from(peer.0));
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, DISCO_HKDF_SALT).extract(dh.as_bytes());
        let okm = prk
            .expand(&[DISCO_HKDF_INFO], &aead::CHACHA20_POLY1305)
            .map_err(|_| Error::InvalidKey(peer.short_string()))?;
        Ok(DiscoShared {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            rng: SystemRandom::new(),
        })
    }
}

impl fmt::Debug for DiscoPrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoPrivate({})", self.public().short_string())
    }
}

/// Symmetric box key for one pair of disco keys
pub struct DiscoShared {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl DiscoShared {
    /// Seal `plaintext` as `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ring::error::Unspecified> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce)?;

        let mut body = plaintext.to_vec();
        self.key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut body,
        )?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    /// Open a box produced by `seal`. `None` on any authentication failure.
    pub fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return None;
        }
        let nonce = Nonce::try_assume_unique_for_key(&sealed[..NONCE_LEN]).ok()?;
        let mut body = sealed[NONCE_LEN..].to_vec();
        let plain = self.key.open_in_place(nonce, Aad::empty(), &mut body).ok()?;
        Some(plain.to_vec())
    }
}

impl fmt::Debug for DiscoShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiscoShared")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_hex_round_trip() {
        let public = NodePrivate::generate().public();
        let parsed = NodePublic::from_hex(&public.to_hex()).unwrap();
        assert_eq!(parsed, public);
        assert!(NodePublic::from_hex("zz").is_err());
        assert!(NodePublic::from_hex("abcd").is_err());
    }

    #[test]
    fn test_zero_private_key() {
        assert!(NodePrivate::zero().is_zero());
        assert!(!NodePrivate::generate().is_zero());
    }

    #[test]
    fn test_short_strings() {
        let node = NodePublic::from_bytes([0xab; KEY_LEN]);
        assert_eq!(node.short_string(), "[abababab]");
        let disco = DiscoPublic::from_bytes([0x01; KEY_LEN]);
        assert_eq!(disco.short_string(), "d:01010101");
    }

    #[test]
    fn test_shared_key_agreement() {
        let a = DiscoPrivate::generate();
        let b = DiscoPrivate::generate();
        let ab = a.shared(&b.public()).unwrap();
        let ba = b.shared(&a.public()).unwrap();

        let sealed = ab.seal(b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + SEAL_OVERHEAD);
        assert_eq!(ba.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_open_rejects_wrong_key_and_tamper() {
        let a = DiscoPrivate::generate();
        let b = DiscoPrivate::generate();
        let c = DiscoPrivate::generate();
        let ab = a.shared(&b.public()).unwrap();
        let cb = c.shared(&b.public()).unwrap();

        let mut sealed = ab.seal(b"ping").unwrap();
        assert!(cb.open(&sealed).is_none());

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(ab.open(&sealed).is_none());
        assert!(ab.open(&sealed[..4]).is_none());
    }
}
