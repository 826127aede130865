//! Cryptographic primitives shared by the rest of the crate.
//!
//! Hashing, key-pair generation, signing/verification and address
//! derivation all live here so that every other module depends on a
//! single, small surface instead of reaching into `ed25519_dalek` or
//! `sha2` directly.

use base64::Engine;
use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("hash conversion error")]
    HashConversionError,
}

/// An account identifier: base64(SHA-256(serialised public key)).
pub type Address = String;

/// Wrapper around an ed25519 public key.
///
/// Mirrors the teacher's `PublicKey` newtype: a fixed-size byte array
/// underneath with hand-written `Serialize`/`Deserialize` so the wire
/// form is stable regardless of the underlying crate's own derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &TransactionSignature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        PublicKey(vk)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Wrapper around an ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSignature(Signature);

impl TransactionSignature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        TransactionSignature(Signature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl From<Signature> for TransactionSignature {
    fn from(sig: Signature) -> Self {
        TransactionSignature(sig)
    }
}

impl Serialize for TransactionSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for TransactionSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
        Ok(TransactionSignature::from_bytes(&array))
    }
}

/// A full ed25519 key pair (signing + verifying halves).
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl KeyPair {
    pub fn public(&self) -> PublicKey {
        self.public_key
    }

    pub fn address(&self) -> Address {
        address_of(&self.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> TransactionSignature {
        self.signing_key.sign(message).into()
    }
}

/// Generate a fresh ed25519 key pair using the OS RNG.
pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = PublicKey::from(signing_key.verifying_key());
    KeyPair {
        signing_key,
        public_key,
    }
}

/// SHA-256 of arbitrary bytes.
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Derive an address (base64 of SHA-256(pubkey bytes)) from a public key.
pub fn address_of(pub_key: &PublicKey) -> Address {
    let digest = hash(&pub_key.to_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Verify `signature` over `message` was produced by `pub_key`.
///
/// Returns `false` rather than an error for ordinary mismatches; only
/// malformed input should ever reach `CryptoError`, and this crate's
/// wrappers keep malformed bytes from being constructed in the first
/// place, so in practice this never errors.
pub fn verify(pub_key: &PublicKey, message: &[u8], signature: &TransactionSignature) -> bool {
    pub_key.verify(message, signature)
}

pub fn sign(key_pair: &KeyPair, message: &[u8]) -> TransactionSignature {
    key_pair.sign(message)
}
