//! A client: holds a key pair and a replica of the chain, posts
//! transactions, and reacts to blocks and missing-block requests.
//!
//! Per spec §9's guidance, inheritance between Client and Miner is
//! replaced by composition: [`crate::miner::Miner`] owns a
//! `Participant` rather than extending it, and both implement
//! [`ParticipantHandle`] for the operations the network needs uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::block::Block;
use crate::chain_store::ChainStore;
use crate::config::{BlockFactory, BlockchainConfig, TransactionFactory};
use crate::crypto::{Address, KeyPair};
use crate::network::{Envelope, MessageKind, MissingBlockRequest, Network};
use crate::transaction::{Output, Transaction, TransactionError, TxData, TxId};

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },
    #[error("transaction construction failed: {0}")]
    Transaction(#[from] TransactionError),
    #[error("failed to encode message payload")]
    Encoding,
}

/// The mailbox-driven side of a participant: anything the [`Network`]
/// needs to deliver an [`Envelope`] to without knowing whether it's
/// talking to a plain client or a miner.
#[async_trait]
pub trait ParticipantHandle: Send {
    fn address(&self) -> Address;
    async fn handle_envelope(&mut self, envelope: Envelope);
}

pub struct Participant {
    pub(crate) key_pair: KeyPair,
    pub(crate) address: Address,
    pub(crate) nonce: u64,
    pub(crate) pending_outgoing: HashMap<TxId, Transaction>,
    pub(crate) chain_store: ChainStore,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) config: Arc<BlockchainConfig>,
}

impl Participant {
    pub fn new(
        key_pair: KeyPair,
        genesis: Block,
        network: Arc<dyn Network>,
        config: Arc<BlockchainConfig>,
    ) -> Self {
        let address = key_pair.address();
        Participant {
            key_pair,
            address: address.clone(),
            nonce: 0,
            pending_outgoing: HashMap::new(),
            chain_store: ChainStore::new(genesis, config.confirmed_depth),
            network,
            config,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn chain_store(&self) -> &ChainStore {
        &self.chain_store
    }

    pub fn pending_transaction(&self, id: &TxId) -> Option<&Transaction> {
        self.pending_outgoing.get(id)
    }

    pub fn pending_outgoing_len(&self) -> usize {
        self.pending_outgoing.len()
    }

    pub fn confirmed_balance(&self) -> u64 {
        self.chain_store
            .last_confirmed_block()
            .balances
            .get(&self.address)
            .copied()
            .unwrap_or(0)
    }

    /// `confirmed_balance - sum(total_output of pending_outgoing)`.
    pub fn available_gold(&self) -> u64 {
        let pending_total: u64 = self
            .pending_outgoing
            .values()
            .map(|tx| tx.total_output())
            .sum();
        self.confirmed_balance().saturating_sub(pending_total)
    }

    /// Build, sign, remember, and broadcast a transfer.
    pub async fn post_transaction(
        &mut self,
        outputs: Vec<Output>,
        fee: u64,
    ) -> Result<TxId, ParticipantError> {
        let requested = fee + outputs.iter().map(|o| o.amount).sum::<u64>();
        let available = self.available_gold();
        if requested > available {
            return Err(ParticipantError::InsufficientFunds {
                requested,
                available,
            });
        }

        let mut tx = self.config.make_transaction(
            self.address.clone(),
            self.nonce,
            self.key_pair.public(),
            outputs,
            Some(fee),
            TxData::new(),
        )?;
        tx.sign(&self.key_pair);
        let id = tx.id();

        self.pending_outgoing.insert(id, tx.clone());
        self.nonce += 1;

        let payload = bincode::serialize(&tx).map_err(|_| ParticipantError::Encoding)?;
        self.network
            .broadcast(&self.address, MessageKind::PostTransaction, payload)
            .await;
        Ok(id)
    }

    /// Rebroadcast every still-pending outgoing transaction. Idempotent.
    pub async fn resend_pending_transactions(&self) {
        for tx in self.pending_outgoing.values() {
            if let Ok(payload) = bincode::serialize(tx) {
                self.network
                    .broadcast(&self.address, MessageKind::PostTransaction, payload)
                    .await;
            }
        }
    }

    /// The consensus heart (spec §4.4): accept the block (and any
    /// children it unblocks), request missing parents, and prune
    /// pending_outgoing against the new confirmed head.
    pub async fn receive_block(&mut self, block: Block) {
        let report = self.chain_store.receive_block(block);

        for missing in &report.missing_block_requests {
            let request = MissingBlockRequest {
                from: self.address.clone(),
                missing: *missing,
            };
            if let Ok(payload) = bincode::serialize(&request) {
                self.network
                    .broadcast(&self.address, MessageKind::MissingBlock, payload)
                    .await;
            }
        }

        if report.rejected > 0 {
            log::debug!(
                "{}: discarded {} block(s) this delivery (invalid proof or replay failure)",
                self.address,
                report.rejected
            );
        }

        if !report.accepted.is_empty() {
            let confirmed = self.chain_store.last_confirmed_block();
            // Spec §4.4 simplification: only check membership in
            // last_confirmed_block itself, not its ancestors.
            self.pending_outgoing.retain(|_, tx| !confirmed.contains(tx));
        }
    }

    /// Reply to a `MissingBlock` request if we have the block.
    pub async fn provide_missing_block(&self, request: MissingBlockRequest) {
        let Some(block) = self.chain_store.get(&request.missing) else {
            return;
        };
        let Ok(payload) = block.serialise() else {
            return;
        };
        if let Err(err) = self
            .network
            .send_to(&request.from, MessageKind::ProofFound, payload)
            .await
        {
            log::debug!(
                "{}: could not reply to missing-block request from {}: {}",
                self.address,
                request.from,
                err
            );
        }
    }
}

#[async_trait]
impl ParticipantHandle for Participant {
    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::ProofFound => match self.config.deserialise_block(&envelope.payload) {
                Ok(block) => self.receive_block(block).await,
                Err(err) => log::warn!("{}: failed to decode proof-found block: {}", self.address, err),
            },
            MessageKind::MissingBlock => {
                match bincode::deserialize::<MissingBlockRequest>(&envelope.payload) {
                    Ok(request) => self.provide_missing_block(request).await,
                    Err(err) => {
                        log::warn!("{}: failed to decode missing-block request: {}", self.address, err)
                    }
                }
            }
            // A pure client never acts on its own postings or a
            // miner-only mining tick (spec §4.5).
            MessageKind::PostTransaction | MessageKind::StartMining => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::network::NoopNetwork;
    use std::collections::BTreeMap;

    fn participant_with_balance(balance: u64) -> Participant {
        let kp = generate_keypair();
        let mut balances = BTreeMap::new();
        balances.insert(kp.address(), balance);
        let config = Arc::new(BlockchainConfig::with_defaults(balances));
        let genesis = config.make_genesis();
        Participant::new(kp, genesis, Arc::new(NoopNetwork), config)
    }

    #[tokio::test]
    async fn post_transaction_fails_when_funds_insufficient() {
        let mut p = participant_with_balance(10);
        let err = p
            .post_transaction(
                vec![Output {
                    amount: 20,
                    address: "bob".into(),
                }],
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParticipantError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn post_transaction_reduces_available_gold_immediately() {
        let mut p = participant_with_balance(100);
        let before = p.available_gold();
        p.post_transaction(
            vec![Output {
                amount: 10,
                address: "bob".into(),
            }],
            1,
        )
        .await
        .unwrap();
        assert_eq!(p.available_gold(), before - 11);
    }

    #[tokio::test]
    async fn nonce_increments_on_each_post() {
        let mut p = participant_with_balance(100);
        p.post_transaction(vec![], 1).await.unwrap();
        p.post_transaction(vec![], 1).await.unwrap();
        assert_eq!(p.nonce, 2);
    }
}
