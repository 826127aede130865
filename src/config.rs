//! Process-wide blockchain parameters: the PoW target, block reward,
//! default fee, confirmation depth, and genesis construction.
//!
//! Per spec §9's design note, this is an immutable value threaded
//! through participants at construction — never a global singleton.

use std::collections::BTreeMap;

use primitive_types::U256;
use thiserror::Error;

use crate::block::{Block, BlockError};
use crate::crypto::{Address, PublicKey};
use crate::transaction::{Output, Transaction, TransactionError, TxData};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pow_leading_zeroes must be in 0..=255, got {0}")]
    PowLeadingZeroesOutOfRange(u32),
}

#[derive(Debug, Clone)]
pub struct BlockchainConfig {
    pub pow_leading_zeroes: u32,
    pub coinbase_reward: u64,
    pub default_tx_fee: u64,
    pub confirmed_depth: u64,
    pub initial_balances: BTreeMap<Address, u64>,
}

impl BlockchainConfig {
    pub fn new(
        pow_leading_zeroes: u32,
        coinbase_reward: u64,
        default_tx_fee: u64,
        confirmed_depth: u64,
        initial_balances: BTreeMap<Address, u64>,
    ) -> Result<Self, ConfigError> {
        if pow_leading_zeroes > 255 {
            return Err(ConfigError::PowLeadingZeroesOutOfRange(pow_leading_zeroes));
        }
        Ok(BlockchainConfig {
            pow_leading_zeroes,
            coinbase_reward,
            default_tx_fee,
            confirmed_depth,
            initial_balances,
        })
    }

    /// Default parameters used throughout this crate's tests and demo
    /// CLI: 15 leading zero bits, reward 25, default fee 1, confirmed
    /// depth 6 — the exact defaults spec §4.7 names.
    pub fn with_defaults(initial_balances: BTreeMap<Address, u64>) -> Self {
        BlockchainConfig::new(15, 25, 1, 6, initial_balances)
            .expect("default pow_leading_zeroes is in range")
    }

    /// `2^256 - 1` right-shifted by `pow_leading_zeroes` bits. Lower
    /// values of `pow_leading_zeroes` yield an easier (larger) target.
    pub fn target(&self) -> U256 {
        U256::MAX >> self.pow_leading_zeroes
    }
}

/// Capability trait so tests can substitute a different block
/// implementation/factory, per spec §9 ("reproduce dynamic dispatch for
/// block/transaction classes as a capability trait").
pub trait BlockFactory: Send + Sync {
    fn make_genesis(&self) -> Block;
    fn make_block(&self, reward_addr: Address, prev: &Block) -> Block;
    fn deserialise_block(&self, bytes: &[u8]) -> Result<Block, BlockError>;
}

pub trait TransactionFactory: Send + Sync {
    fn make_transaction(
        &self,
        from: Address,
        nonce: u64,
        pub_key: PublicKey,
        outputs: Vec<Output>,
        fee: Option<u64>,
        data: TxData,
    ) -> Result<Transaction, TransactionError>;
}

impl BlockFactory for BlockchainConfig {
    fn make_genesis(&self) -> Block {
        Block::genesis(self.initial_balances.clone(), self.target(), self.coinbase_reward)
    }

    fn make_block(&self, reward_addr: Address, prev: &Block) -> Block {
        Block::new(reward_addr, prev, self.target(), self.coinbase_reward)
    }

    fn deserialise_block(&self, bytes: &[u8]) -> Result<Block, BlockError> {
        Block::from_wire(bytes, self.target(), self.coinbase_reward)
    }
}

impl TransactionFactory for BlockchainConfig {
    fn make_transaction(
        &self,
        from: Address,
        nonce: u64,
        pub_key: PublicKey,
        outputs: Vec<Output>,
        fee: Option<u64>,
        data: TxData,
    ) -> Result<Transaction, TransactionError> {
        Transaction::new(
            from,
            nonce,
            pub_key,
            outputs,
            fee.unwrap_or(self.default_tx_fee),
            data,
        )
    }
}
