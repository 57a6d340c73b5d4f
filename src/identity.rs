//! Ephemeral node identities.
//!
//! A [`NodeIdentity`] is an Ed25519 key pair generated fresh for every process.
//! Peers are named by [`PeerId`], the SHA-256 fingerprint of the public key.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length of a [`PeerId`] in bytes.
pub const PEER_ID_LENGTH: usize = 32;

/// Stable identifier of a node: SHA-256 of its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Derive the identifier of a public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; PEER_ID_LENGTH];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }

    /// First five bytes in hex, for log lines.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| Error::invalid_address(format!("peer id {s:?}: {e}")))?;
        let bytes: [u8; PEER_ID_LENGTH] = raw.try_into().map_err(|raw: Vec<u8>| {
            Error::invalid_address(format!(
                "peer id must be {PEER_ID_LENGTH} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 key pair and the [`PeerId`] derived from it.
///
/// Never persisted: every process run gets a new, unlinkable identity.
pub struct NodeIdentity {
    signing_key: SigningKey,
    id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS randomness source.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));
        seed.zeroize();
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = PeerId::from_public_key(&signing_key.verifying_key());
        Self { signing_key, id }
    }

    /// The identifier other peers know this node by.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The Ed25519 public key.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    #[cfg(test)]
    pub(crate) fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity").field("id", &self.id).finish_non_exhaustive()
    }
}
