//! Signed transfer records.
//!
//! A `Transaction` moves value from one address to a set of outputs,
//! pays its own inclusion fee, and is made tamper-evident by an ed25519
//! signature over its id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, Address, CryptoError, KeyPair, PublicKey, TransactionSignature};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("failed to canonicalise transaction for hashing")]
    Canonicalisation,
}

pub type TxId = [u8; 32];

/// One `(amount, address)` entry in a transaction's output list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub address: Address,
}

/// Opaque per-transaction attachment. A `BTreeMap` gives a canonical
/// key order so that two semantically-equal attachments serialise to
/// identical bytes and therefore hash identically.
pub type TxData = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct Transaction {
    pub from: Address,
    pub nonce: u64,
    pub pub_key: PublicKey,
    pub outputs: Vec<Output>,
    pub fee: u64,
    pub data: TxData,
    pub sig: Option<TransactionSignature>,
    id: TxId,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Transaction {}

/// Wire form of a transaction. Excludes `id`, which is derived from the
/// other fields rather than carried on the wire — mirrors `block.rs`'s
/// `BlockWire`.
#[derive(Serialize, Deserialize)]
struct TxWire {
    from: Address,
    nonce: u64,
    pub_key: PublicKey,
    outputs: Vec<Output>,
    fee: u64,
    data: TxData,
    sig: Option<TransactionSignature>,
}

impl Serialize for Transaction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        TxWire {
            from: self.from.clone(),
            nonce: self.nonce,
            pub_key: self.pub_key,
            outputs: self.outputs.clone(),
            fee: self.fee,
            data: self.data.clone(),
            sig: self.sig,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = TxWire::deserialize(deserializer)?;
        let mut tx = Transaction {
            from: wire.from,
            nonce: wire.nonce,
            pub_key: wire.pub_key,
            outputs: wire.outputs,
            fee: wire.fee,
            data: wire.data,
            sig: wire.sig,
            id: [0; 32],
        };
        tx.id = tx.compute_id().map_err(serde::de::Error::custom)?;
        Ok(tx)
    }
}

/// Fields that participate in a transaction's id (and therefore in the
/// message a signature covers). `sig` is deliberately excluded.
#[derive(Serialize)]
struct SignedFields<'a> {
    from: &'a Address,
    nonce: u64,
    pub_key: &'a PublicKey,
    outputs: &'a [Output],
    fee: u64,
    data: &'a TxData,
}

impl Transaction {
    /// Build an unsigned transaction. The id is computed immediately
    /// from the signed-field set; call [`Transaction::sign`] to attach
    /// a signature over that id.
    pub fn new(
        from: Address,
        nonce: u64,
        pub_key: PublicKey,
        outputs: Vec<Output>,
        fee: u64,
        data: TxData,
    ) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            from,
            nonce,
            pub_key,
            outputs,
            fee,
            data,
            sig: None,
            id: [0; 32],
        };
        tx.id = tx.compute_id()?;
        Ok(tx)
    }

    fn compute_id(&self) -> Result<TxId, TransactionError> {
        let fields = SignedFields {
            from: &self.from,
            nonce: self.nonce,
            pub_key: &self.pub_key,
            outputs: &self.outputs,
            fee: self.fee,
            data: &self.data,
        };
        let bytes =
            bincode::serialize(&fields).map_err(|_| TransactionError::Canonicalisation)?;
        Ok(crypto::hash(&bytes))
    }

    /// Cached transaction id, stable across serialise/deserialise.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Sign the transaction (over its id) with `key_pair`'s private key.
    pub fn sign(&mut self, key_pair: &KeyPair) {
        self.sig = Some(crypto::sign(key_pair, &self.id));
    }

    /// True iff a signature is present, it was made by the key matching
    /// `from`, the cached id still matches the current field values
    /// (catching any mutation of a signed field after construction —
    /// every field above is `pub`, so nothing else stops a caller from
    /// changing `fee` or `outputs` in place), and the signature
    /// verifies over that id.
    pub fn valid_signature(&self) -> bool {
        let Some(sig) = &self.sig else {
            return false;
        };
        if crypto::address_of(&self.pub_key) != self.from {
            return false;
        }
        match self.compute_id() {
            Ok(recomputed) if recomputed == self.id => crypto::verify(&self.pub_key, &self.id, sig),
            _ => false,
        }
    }

    pub fn total_output(&self) -> u64 {
        self.fee + self.outputs.iter().map(|o| o.amount).sum::<u64>()
    }

    /// True iff `self.total_output() <= balances[from]` (0 if absent).
    pub fn sufficient_funds(&self, balances: &BTreeMap<Address, u64>) -> bool {
        let available = balances.get(&self.from).copied().unwrap_or(0);
        self.total_output() <= available
    }
}
