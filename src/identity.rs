//! Peer identities and message signatures.
//!
//! A peer identity is its Ed25519 verifying key: 32 opaque bytes that are
//! stable for the lifetime of the node and usable as a map key. Because the
//! identity *is* the key, message signatures verify directly against the
//! `from` field without a separate key-distribution step; the optional `key`
//! field on the wire is only honoured when it matches `from`.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for published-message signatures.
/// Prevents cross-protocol replay of signatures made by the same key.
const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"meshcast-pub-v1:";

/// Opaque stable identifier for a peer. Comparison is byte equality;
/// ordering is lexicographic and carries no meaning beyond determinism.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Truncated hex rendering for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Ed25519 keypair backing a local node identity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing.verifying_key().to_bytes())
    }

    /// Sign the canonical serialization of a published message.
    pub fn sign_message(&self, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
        let input = signing_input(&self.peer_id(), topic, seqno, data);
        self.signing.sign(&input).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.peer_id().short())
    }
}

/// Signature verification failures, reported distinctly so scoring can
/// penalize malformed keys and bad signatures the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// `from` does not decode as a verifying key.
    MalformedKey,
    /// The signature bytes are not a valid Ed25519 signature encoding.
    MalformedSignature,
    /// An embedded `key` field disagrees with `from`.
    KeyMismatch,
    /// The signature does not verify over the canonical payload.
    Invalid,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedKey => write!(f, "source is not a valid verifying key"),
            Self::MalformedSignature => write!(f, "malformed signature encoding"),
            Self::KeyMismatch => write!(f, "embedded key does not match source"),
            Self::Invalid => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Verify a published message's signature against its `from` identity.
///
/// `key` is the optional embedded verifying key from the wire; when present
/// it must equal `from`, otherwise the message is treated as forged.
pub fn verify_message(
    from: &PeerId,
    topic: &str,
    seqno: u64,
    data: &[u8],
    signature: &[u8],
    key: Option<&[u8]>,
) -> Result<(), SignatureError> {
    if let Some(key) = key {
        if key != from.as_bytes() {
            return Err(SignatureError::KeyMismatch);
        }
    }
    let verifying =
        VerifyingKey::from_bytes(from.as_bytes()).map_err(|_| SignatureError::MalformedKey)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| SignatureError::MalformedSignature)?;

    let input = signing_input(from, topic, seqno, data);
    verifying
        .verify(&input, &signature)
        .map_err(|_| SignatureError::Invalid)
}

/// Canonical byte representation covered by a message signature, with the
/// domain prefix prepended.
///
/// Format: domain || source(32) || topic_len(4) || topic || seqno(8) ||
/// data_len(4) || data. The source identity is included so a signature
/// cannot be replayed under a different claimed origin.
fn signing_input(source: &PeerId, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
    let topic_bytes = topic.as_bytes();
    let mut input = Vec::with_capacity(
        MESSAGE_SIGNATURE_DOMAIN.len() + 32 + 4 + topic_bytes.len() + 8 + 4 + data.len(),
    );
    input.extend_from_slice(MESSAGE_SIGNATURE_DOMAIN);
    input.extend_from_slice(source.as_bytes());
    input.extend_from_slice(&(topic_bytes.len() as u32).to_le_bytes());
    input.extend_from_slice(topic_bytes);
    input.extend_from_slice(&seqno.to_le_bytes());
    input.extend_from_slice(&(data.len() as u32).to_le_bytes());
    input.extend_from_slice(data);
    input
}
