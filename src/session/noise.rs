//! Noise XX handshake run on the first stream of a QUIC connection.
//!
//! Messages travel as `u16` big-endian length + Noise message. Messages two
//! and three carry an [`IdentityProof`] binding the sender's Ed25519 identity
//! to its Noise static key. The prologue is keying material exported from the
//! QUIC TLS session, so a handshake cannot be relayed onto another connection.

use std::fmt;

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PeerId};
use crate::stream::read_exact_error;

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const MAX_NOISE_MESSAGE: usize = 65535;
const EXPORTER_LABEL: &[u8] = b"EXPORTER-lanlink-noise";
const PROLOGUE_LEN: usize = 32;
const PROOF_CONTEXT: &[u8] = b"lanlink-noise-static:";

/// Encoded size of an [`IdentityProof`].
pub(crate) const PROOF_LEN: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

fn params() -> Result<snow::params::NoiseParams> {
    NOISE_PARAMS.parse().map_err(Error::handshake)
}

/// Per-endpoint X25519 static key pair.
pub(crate) struct NoiseKeys {
    private: Vec<u8>,
    public: Vec<u8>,
}

impl NoiseKeys {
    pub(crate) fn generate() -> Result<Self> {
        let keypair = snow::Builder::new(params()?)
            .generate_keypair()
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        Ok(Self {
            private: keypair.private,
            public: keypair.public,
        })
    }
}

impl fmt::Debug for NoiseKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseKeys")
            .field("public", &hex::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key plus its signature over a Noise static key.
#[derive(Debug, Clone)]
pub(crate) struct IdentityProof {
    key: VerifyingKey,
    signature: Signature,
}

fn signed_message(noise_static: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PROOF_CONTEXT.len() + noise_static.len());
    msg.extend_from_slice(PROOF_CONTEXT);
    msg.extend_from_slice(noise_static);
    msg
}

impl IdentityProof {
    pub(crate) fn sign(identity: &NodeIdentity, noise_static: &[u8]) -> Self {
        Self {
            key: identity.public_key(),
            signature: identity.sign(&signed_message(noise_static)),
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; PROOF_LEN] {
        let mut out = [0u8; PROOF_LEN];
        out[..PUBLIC_KEY_LENGTH].copy_from_slice(self.key.as_bytes());
        out[PUBLIC_KEY_LENGTH..].copy_from_slice(&self.signature.to_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PROOF_LEN {
            return Err(Error::handshake(format!(
                "identity proof must be {PROOF_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; PUBLIC_KEY_LENGTH];
        key.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);
        Ok(Self {
            key: VerifyingKey::from_bytes(&key).map_err(Error::handshake)?,
            signature: Signature::from_bytes(&signature),
        })
    }

    /// Check the proof against the static key observed in the handshake and
    /// return the identity it proves.
    pub(crate) fn verify(&self, noise_static: &[u8]) -> Result<PeerId> {
        self.key
            .verify_strict(&signed_message(noise_static), &self.signature)
            .map_err(|_| Error::handshake("identity proof does not match noise static key"))?;
        Ok(PeerId::from_public_key(&self.key))
    }
}

/// Result of a completed handshake.
#[derive(Debug)]
pub(crate) struct HandshakeOutcome {
    pub(crate) remote: PeerId,
    pub(crate) session_id: Vec<u8>,
}

fn channel_binding(conn: &quinn::Connection) -> Result<[u8; PROLOGUE_LEN]> {
    let mut prologue = [0u8; PROLOGUE_LEN];
    conn.export_keying_material(&mut prologue, EXPORTER_LABEL, b"")
        .map_err(|_| Error::handshake("could not export TLS keying material"))?;
    Ok(prologue)
}

/// Stream failures during the handshake are handshake failures, except when
/// the local endpoint is shutting down.
fn handshake_io(err: Error) -> Error {
    match err {
        Error::Closed => Error::Closed,
        other => Error::handshake(other),
    }
}

async fn write_frame(send: &mut quinn::SendStream, frame: &[u8]) -> Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| Error::handshake("noise message too long"))?;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| handshake_io(e.into()))?;
    send.write_all(frame)
        .await
        .map_err(|e| handshake_io(e.into()))
}

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    recv.read_exact(&mut len)
        .await
        .map_err(|e| handshake_io(read_exact_error(e)))?;
    let mut frame = vec![0u8; usize::from(u16::from_be_bytes(len))];
    recv.read_exact(&mut frame)
        .await
        .map_err(|e| handshake_io(read_exact_error(e)))?;
    Ok(frame)
}

/// Run the initiator side and check the responder is `expected`.
pub(crate) async fn initiate(
    conn: &quinn::Connection,
    identity: &NodeIdentity,
    keys: &NoiseKeys,
    expected: PeerId,
) -> Result<HandshakeOutcome> {
    let prologue = channel_binding(conn)?;
    let mut noise = snow::Builder::new(params()?)
        .local_private_key(&keys.private)
        .prologue(&prologue)
        .build_initiator()
        .map_err(Error::handshake)?;
    let (mut send, mut recv) = conn.open_bi().await.map_err(|e| handshake_io(e.into()))?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let mut payload = vec![0u8; MAX_NOISE_MESSAGE];

    // -> e
    let len = noise.write_message(&[], &mut buf).map_err(Error::handshake)?;
    write_frame(&mut send, &buf[..len]).await?;

    // <- e, ee, s, es, proof
    let frame = read_frame(&mut recv).await?;
    let n = noise
        .read_message(&frame, &mut payload)
        .map_err(Error::handshake)?;
    let remote_static = noise
        .get_remote_static()
        .ok_or_else(|| Error::handshake("responder sent no static key"))?
        .to_vec();
    let actual = IdentityProof::from_bytes(&payload[..n])?.verify(&remote_static)?;
    if actual != expected {
        return Err(Error::IdentityMismatch { expected, actual });
    }

    // -> s, se, proof
    let proof = IdentityProof::sign(identity, &keys.public).to_bytes();
    let len = noise
        .write_message(&proof, &mut buf)
        .map_err(Error::handshake)?;
    write_frame(&mut send, &buf[..len]).await?;
    send.finish().map_err(Error::handshake)?;

    // The responder finishes its side once it accepted our proof.
    recv.read_to_end(0)
        .await
        .map_err(|e| handshake_io(e.into()))?;

    Ok(HandshakeOutcome {
        remote: actual,
        session_id: noise.get_handshake_hash().to_vec(),
    })
}

/// Run the responder side on the first stream the initiator opens.
pub(crate) async fn respond(
    conn: &quinn::Connection,
    identity: &NodeIdentity,
    keys: &NoiseKeys,
) -> Result<HandshakeOutcome> {
    let prologue = channel_binding(conn)?;
    let mut noise = snow::Builder::new(params()?)
        .local_private_key(&keys.private)
        .prologue(&prologue)
        .build_responder()
        .map_err(Error::handshake)?;
    let (mut send, mut recv) = conn
        .accept_bi()
        .await
        .map_err(|e| handshake_io(e.into()))?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
    let mut payload = vec![0u8; MAX_NOISE_MESSAGE];

    // <- e
    let frame = read_frame(&mut recv).await?;
    noise
        .read_message(&frame, &mut payload)
        .map_err(Error::handshake)?;

    // -> e, ee, s, es, proof
    let proof = IdentityProof::sign(identity, &keys.public).to_bytes();
    let len = noise
        .write_message(&proof, &mut buf)
        .map_err(Error::handshake)?;
    write_frame(&mut send, &buf[..len]).await?;

    // <- s, se, proof
    let frame = read_frame(&mut recv).await?;
    let n = noise
        .read_message(&frame, &mut payload)
        .map_err(Error::handshake)?;
    let remote_static = noise
        .get_remote_static()
        .ok_or_else(|| Error::handshake("initiator sent no static key"))?
        .to_vec();
    let remote = IdentityProof::from_bytes(&payload[..n])?.verify(&remote_static)?;
    send.finish().map_err(Error::handshake)?;

    Ok(HandshakeOutcome {
        remote,
        session_id: noise.get_handshake_hash().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_verifies_for_signed_static_key() {
        let identity = NodeIdentity::generate().unwrap();
        let keys = NoiseKeys::generate().unwrap();
        let bytes = IdentityProof::sign(&identity, &keys.public).to_bytes();

        let proven = IdentityProof::from_bytes(&bytes)
            .unwrap()
            .verify(&keys.public)
            .unwrap();
        assert_eq!(proven, identity.id());
    }

    #[test]
    fn proof_rejects_other_static_key() {
        let identity = NodeIdentity::generate().unwrap();
        let ours = NoiseKeys::generate().unwrap();
        let theirs = NoiseKeys::generate().unwrap();
        let proof = IdentityProof::sign(&identity, &ours.public);

        assert!(matches!(
            proof.verify(&theirs.public),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let identity = NodeIdentity::generate().unwrap();
        let keys = NoiseKeys::generate().unwrap();
        let mut bytes = IdentityProof::sign(&identity, &keys.public).to_bytes();
        bytes[PROOF_LEN - 1] ^= 0x01;

        let result = IdentityProof::from_bytes(&bytes).and_then(|p| p.verify(&keys.public));
        assert!(result.is_err());
        assert!(IdentityProof::from_bytes(&bytes[..PROOF_LEN - 1]).is_err());
    }

    #[test]
    fn keys_debug_hides_private_half() {
        let keys = NoiseKeys::generate().unwrap();
        let debug = format!("{keys:?}");
        assert!(debug.contains(&hex::encode(&keys.public)));
        assert!(!debug.contains(&hex::encode(&keys.private)));
    }

    #[test]
    fn xx_handshake_carries_proofs_in_memory() {
        let alice = NodeIdentity::generate().unwrap();
        let bob = NodeIdentity::generate().unwrap();
        let alice_keys = NoiseKeys::generate().unwrap();
        let bob_keys = NoiseKeys::generate().unwrap();
        let prologue = [7u8; PROLOGUE_LEN];

        let mut initiator = snow::Builder::new(params().unwrap())
            .local_private_key(&alice_keys.private)
            .prologue(&prologue)
            .build_initiator()
            .unwrap();
        let mut responder = snow::Builder::new(params().unwrap())
            .local_private_key(&bob_keys.private)
            .prologue(&prologue)
            .build_responder()
            .unwrap();
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let mut payload = vec![0u8; MAX_NOISE_MESSAGE];

        let len = initiator.write_message(&[], &mut buf).unwrap();
        responder.read_message(&buf[..len], &mut payload).unwrap();

        let proof = IdentityProof::sign(&bob, &bob_keys.public).to_bytes();
        let len = responder.write_message(&proof, &mut buf).unwrap();
        let n = initiator.read_message(&buf[..len], &mut payload).unwrap();
        let remote_static = initiator.get_remote_static().unwrap().to_vec();
        let proven = IdentityProof::from_bytes(&payload[..n])
            .unwrap()
            .verify(&remote_static)
            .unwrap();
        assert_eq!(proven, bob.id());

        let proof = IdentityProof::sign(&alice, &alice_keys.public).to_bytes();
        let len = initiator.write_message(&proof, &mut buf).unwrap();
        let n = responder.read_message(&buf[..len], &mut payload).unwrap();
        let remote_static = responder.get_remote_static().unwrap().to_vec();
        let proven = IdentityProof::from_bytes(&payload[..n])
            .unwrap()
            .verify(&remote_static)
            .unwrap();
        assert_eq!(proven, alice.id());

        assert!(initiator.is_handshake_finished());
        assert_eq!(
            initiator.get_handshake_hash(),
            responder.get_handshake_hash()
        );
    }
}
