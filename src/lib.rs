// src/lib.rs

//! # simchain - a small account-based proof-of-work blockchain
//!
//! A teaching-scale blockchain: accounts and balances rather than
//! UTXOs, SHA-256/ed25519 cryptography, and a longest-chain proof-of-work
//! consensus run over an in-process gossip simulator.
//!
//! ## Core Modules
//!
//! - [`crypto`]: key pairs, addresses, signing and verification
//! - [`transaction`]: signed transfers between accounts
//! - [`block`]: per-height ledger snapshots and proof-of-work validation
//! - [`chain_store`]: per-participant chain replica and fork handling
//! - [`participant`]: clients that post transactions and track balances
//! - [`miner`]: participants that also assemble and mine candidate blocks
//! - [`network`]: the gossip transport abstraction and its in-process simulator
//! - [`config`]: process-wide consensus parameters and block/transaction factories

pub mod block;
pub mod chain_store;
pub mod config;
pub mod crypto;
pub mod miner;
pub mod network;
pub mod participant;
pub mod transaction;
