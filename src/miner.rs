//! Miners: a [`Participant`] plus a candidate block under construction
//! and the proof-of-work search over it.
//!
//! Per spec §9, `Miner` owns a `Participant` instead of extending it —
//! composition stands in for the class inheritance the original design
//! used to share client behaviour.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::block::{Block, BlockError, BlockId};
use crate::config::{BlockFactory, BlockchainConfig};
use crate::crypto::{Address, KeyPair};
use crate::network::{Envelope, MessageKind, Network};
use crate::participant::{Participant, ParticipantHandle};
use crate::transaction::{Transaction, TxId};

/// How many proof attempts a miner makes between cooperative yields.
/// Keeps a single-threaded runtime responsive under many concurrent
/// miners, matching spec §4.6's "mining proceeds in bounded rounds".
pub const DEFAULT_MINING_ROUNDS: u64 = 2000;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("failed to encode mined block")]
    Encoding,
}

pub struct Miner {
    participant: Participant,
    current_block: Block,
    mining_rounds: u64,
}

impl Miner {
    pub fn new(
        key_pair: KeyPair,
        genesis: Block,
        network: Arc<dyn Network>,
        config: Arc<BlockchainConfig>,
    ) -> Self {
        Miner::with_mining_rounds(key_pair, genesis, network, config, DEFAULT_MINING_ROUNDS)
    }

    pub fn with_mining_rounds(
        key_pair: KeyPair,
        genesis: Block,
        network: Arc<dyn Network>,
        config: Arc<BlockchainConfig>,
        mining_rounds: u64,
    ) -> Self {
        let participant = Participant::new(key_pair, genesis, network, config);
        let prev = participant.chain_store().last_block().clone();
        let current_block = participant.config.make_block(participant.address().clone(), &prev);
        Miner {
            participant,
            current_block,
            mining_rounds,
        }
    }

    pub fn address(&self) -> &Address {
        self.participant.address()
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn current_block(&self) -> &Block {
        &self.current_block
    }

    /// Try to include `tx` in the block currently under construction.
    pub fn add_to_current_block(&mut self, tx: &Transaction) -> Result<bool, BlockError> {
        self.current_block.add_transaction(tx)
    }

    /// Chunked proof search: check `mining_rounds` candidate proofs,
    /// then yield so other tasks on the runtime get a turn. Returns
    /// once `current_block` satisfies its target.
    async fn find_proof(&mut self) {
        loop {
            for _ in 0..self.mining_rounds {
                if self.current_block.has_valid_proof() {
                    return;
                }
                self.current_block.proof += 1;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Every block id from `start` back to genesis, following
    /// `prev_block_hash`.
    fn ancestor_ids(&self, start: Option<BlockId>) -> Vec<BlockId> {
        let mut ids = Vec::new();
        let mut current = start;
        while let Some(id) = current {
            match self.participant.chain_store().get(&id) {
                Some(block) => {
                    ids.push(id);
                    current = block.prev_block_hash;
                }
                None => break,
            }
        }
        ids
    }

    /// Walk the orphaned chain rooted at `old_head` and the new chain
    /// head back to their common ancestor, and collect every
    /// transaction committed on the old chain that the new chain
    /// doesn't also carry. Without this, a transaction confirmed in a
    /// block that a reorg discards would be lost outright instead of
    /// being reconsidered for inclusion.
    fn sync_transactions(&self, old_head: Option<BlockId>) -> Vec<Transaction> {
        let new_head = Some(self.participant.chain_store().last_block_id());
        let old_chain = self.ancestor_ids(old_head);
        let new_chain = self.ancestor_ids(new_head);
        let new_chain_set: HashSet<BlockId> = new_chain.iter().copied().collect();
        let common_ancestor = old_chain.iter().find(|id| new_chain_set.contains(*id)).copied();

        let new_tx_ids: HashSet<TxId> = new_chain
            .iter()
            .take_while(|id| Some(**id) != common_ancestor)
            .filter_map(|id| self.participant.chain_store().get(id))
            .flat_map(|block| block.transactions.keys().copied())
            .collect();

        old_chain
            .iter()
            .take_while(|id| Some(**id) != common_ancestor)
            .filter_map(|id| self.participant.chain_store().get(id))
            .flat_map(|block| block.transactions.values().cloned())
            .filter(|tx| !new_tx_ids.contains(&tx.id()))
            .collect()
    }

    /// Discard the stale candidate and start a fresh one atop the
    /// current chain head, carrying over any of its own not-yet-
    /// committed transactions plus any recovered from an orphaned fork.
    fn start_new_block(&mut self) {
        let old_head = self.current_block.prev_block_hash;
        let recovered = self.sync_transactions(old_head);

        let prev = self.participant.chain_store().last_block().clone();
        let carried: Vec<Transaction> = self
            .current_block
            .transactions
            .values()
            .cloned()
            .chain(recovered)
            .collect();
        self.current_block = self
            .participant
            .config
            .make_block(self.participant.address().clone(), &prev);
        for tx in carried {
            if !self.current_block.contains(&tx) {
                // Already-confirmed or now-invalid transactions are
                // silently dropped; anything still good is re-included.
                let _ = self.current_block.add_transaction(&tx);
            }
        }
    }

    /// Run the proof search to completion, broadcast the mined block,
    /// fold it into our own chain, and start the next one.
    pub async fn mine_and_broadcast(&mut self) -> Result<(), MinerError> {
        self.find_proof().await;

        let payload = self.current_block.serialise().map_err(MinerError::Block)?;
        self.participant
            .network
            .broadcast(&self.participant.address, MessageKind::ProofFound, payload)
            .await;

        let mined = self.current_block.clone();
        self.participant.receive_block(mined).await;
        self.start_new_block();
        Ok(())
    }

    /// Resync the candidate block if the chain head moved out from
    /// under it without us being the one who mined it (a competing
    /// miner won the round).
    fn resync_if_stale(&mut self) {
        let head = self.participant.chain_store().last_block_id();
        if self.current_block.prev_block_hash != Some(head) {
            self.start_new_block();
        }
    }
}

#[async_trait]
impl ParticipantHandle for Miner {
    fn address(&self) -> Address {
        self.participant.address().clone()
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::PostTransaction => match bincode::deserialize::<Transaction>(&envelope.payload) {
                Ok(tx) => match self.add_to_current_block(&tx) {
                    Ok(true) => log::debug!("{}: included transaction in candidate block", self.address()),
                    Ok(false) => log::debug!("{}: transaction deferred (out of order nonce)", self.address()),
                    Err(err) => log::debug!("{}: rejected incoming transaction: {}", self.address(), err),
                },
                Err(err) => log::warn!("{}: failed to decode posted transaction: {}", self.address(), err),
            },
            MessageKind::ProofFound => match self.participant.config.deserialise_block(&envelope.payload) {
                Ok(block) => {
                    self.participant.receive_block(block).await;
                    self.resync_if_stale();
                }
                Err(err) => log::warn!("{}: failed to decode proof-found block: {}", self.address(), err),
            },
            MessageKind::MissingBlock => {
                match bincode::deserialize(&envelope.payload) {
                    Ok(request) => self.participant.provide_missing_block(request).await,
                    Err(err) => log::warn!("{}: failed to decode missing-block request: {}", self.address(), err),
                }
            }
            MessageKind::StartMining => {
                if let Err(err) = self.mine_and_broadcast().await {
                    log::warn!("{}: mining round failed: {}", self.address(), err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::network::NoopNetwork;
    use crate::transaction::{Output, TxData};
    use primitive_types::U256;
    use std::collections::BTreeMap;

    fn config_with_easy_target(balances: BTreeMap<Address, u64>) -> BlockchainConfig {
        BlockchainConfig::new(1, 25, 1, 6, balances).unwrap()
    }

    fn miner_with_balance(balance: u64) -> Miner {
        let kp = generate_keypair();
        let mut balances = BTreeMap::new();
        balances.insert(kp.address(), balance);
        let config = Arc::new(config_with_easy_target(balances));
        let genesis = config.make_genesis();
        Miner::new(kp, genesis, Arc::new(NoopNetwork), config)
    }

    #[tokio::test]
    async fn mine_and_broadcast_finds_a_valid_proof() {
        let mut miner = miner_with_balance(100);
        miner.mine_and_broadcast().await.unwrap();
        assert_eq!(miner.participant().chain_store().last_block().chain_length, 1);
    }

    #[test]
    fn add_to_current_block_rejects_duplicate() {
        let alice = generate_keypair();
        let mut balances = BTreeMap::new();
        balances.insert(alice.address(), 100);
        let config = Arc::new(config_with_easy_target(balances));
        let genesis = config.make_genesis();
        let mut miner = Miner::new(alice.clone(), genesis, Arc::new(NoopNetwork), config);

        let mut tx = Transaction::new(alice.address(), 0, alice.public(), vec![], 1, TxData::new())
            .unwrap();
        tx.sign(&alice);
        assert_eq!(miner.add_to_current_block(&tx).unwrap(), true);
        assert!(matches!(
            miner.add_to_current_block(&tx),
            Err(BlockError::DuplicateTransaction)
        ));
    }

    #[test]
    fn start_new_block_carries_over_uncommitted_transactions() {
        let alice = generate_keypair();
        let mut balances = BTreeMap::new();
        balances.insert(alice.address(), 100);
        let config = Arc::new(config_with_easy_target(balances));
        let genesis = config.make_genesis();
        let mut miner = Miner::new(alice.clone(), genesis, Arc::new(NoopNetwork), config);

        let mut tx = Transaction::new(
            alice.address(),
            0,
            alice.public(),
            vec![Output {
                amount: 1,
                address: "bob".into(),
            }],
            1,
            TxData::new(),
        )
        .unwrap();
        tx.sign(&alice);
        miner.add_to_current_block(&tx).unwrap();

        miner.start_new_block();
        assert!(miner.current_block().contains(&tx));
    }

    #[test]
    fn target_of_one_always_eventually_satisfies() {
        // sanity check that U256::MAX >> 1 is not degenerate
        assert!(U256::MAX >> 1 > U256::from(0u8));
    }
}
