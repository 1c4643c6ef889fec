//! Replica identity.
//!
//! Every replica holds an ed25519 signing key. The public half is the
//! replica's id: it is globally unique without coordination, totally ordered
//! (byte-wise), and lets any receiver check that an operation really came
//! from the replica it names.

use blake3::Hasher;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use rand_core::OsRng;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// A replica id: the 32-byte ed25519 public key of the replica.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub [u8; 32]);

/// A signing key for one replica.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaKey {
    id: ReplicaId,
    secret: [u8; 32],
}

/// A signature, 64 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

/// A blake3 hash, 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 32]);

/// Hash a message using blake3.
pub fn hash(message: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(message);
    return Hash(*hasher.finalize().as_bytes());
}

impl ReplicaId {
    /// Smallest possible id. Reserved for the head sentinel.
    pub const MIN: ReplicaId = ReplicaId([0; 32]);
    /// Largest possible id. Reserved for the tail sentinel.
    pub const MAX: ReplicaId = ReplicaId([0xff; 32]);

    /// Verify a signature against this replica's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let verifying = match VerifyingKey::from_bytes(&self.0) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        return verifying.verify(message, &sig).is_ok();
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        return hex(&self.0[..4]);
    }
}

impl ReplicaKey {
    /// Generate a fresh random key.
    pub fn generate() -> ReplicaKey {
        let signing = SigningKey::generate(&mut OsRng);
        return ReplicaKey::from_signing(signing);
    }

    /// Rebuild a key from its 32 secret bytes.
    pub fn from_secret(secret: [u8; 32]) -> ReplicaKey {
        return ReplicaKey::from_signing(SigningKey::from_bytes(&secret));
    }

    fn from_signing(signing: SigningKey) -> ReplicaKey {
        return ReplicaKey {
            id: ReplicaId(signing.verifying_key().to_bytes()),
            secret: signing.to_bytes(),
        };
    }

    pub fn id(&self) -> ReplicaId {
        return self.id;
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = SigningKey::from_bytes(&self.secret);
        return Signature(signing.sign(message).to_bytes());
    }
}

fn hex(bytes: &[u8]) -> String {
    return bytes.iter().map(|b| format!("{:02x}", b)).collect();
}

fn unhex<const N: usize>(text: &str) -> Option<[u8; N]> {
    if text.len() != N * 2 || !text.is_ascii() {
        return None;
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    return Some(out);
}

// Ids and signatures travel as hex strings so that they can key JSON maps.

impl Serialize for ReplicaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        return serializer.serialize_str(&hex(&self.0));
    }
}

impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        return unhex::<32>(&text)
            .map(ReplicaId)
            .ok_or_else(|| serde::de::Error::custom("invalid replica id"));
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        return serializer.serialize_str(&hex(&self.0));
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        return unhex::<64>(&text)
            .map(Signature)
            .ok_or_else(|| serde::de::Error::custom("invalid signature"));
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        return serializer.serialize_str(&hex(&self.0));
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        return unhex::<32>(&text)
            .map(Hash)
            .ok_or_else(|| serde::de::Error::custom("invalid hash"));
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.short());
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", hex(&self.0));
    }
}

impl std::fmt::Debug for ReplicaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "ReplicaKey({})", hex(&self.id.0));
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "Signature({})", hex(&self.0));
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "Hash({})", hex(&self.0));
    }
}
