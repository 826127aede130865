//! Per-participant replica of the chain: every accepted block, the
//! index of blocks buffered behind a missing parent, and the current
//! head / confirmed-head pointers.

use std::collections::{HashMap, VecDeque};

use crate::block::{Block, BlockId};

/// Outcome of trying to accept one block (spec §4.4 steps 1-5).
enum AcceptOutcome {
    AlreadyKnown,
    InvalidProof,
    ReplayFailed,
    MissingParent { missing: BlockId, first_for_parent: bool },
    Accepted(BlockId),
}

/// Result of a (possibly recursive) call to [`ChainStore::receive_block`].
#[derive(Debug, Default)]
pub struct ReceiveReport {
    /// Ids of every block newly inserted during this call, in
    /// acceptance order (the originally-delivered block first, then any
    /// previously-buffered descendants unblocked by it).
    pub accepted: Vec<BlockId>,
    /// Parent ids for which a `MissingBlock` request should be
    /// broadcast — one entry per *newly* missing parent (spec: "if the
    /// set was previously empty").
    pub missing_block_requests: Vec<BlockId>,
    /// Count of blocks discarded this call (invalid proof or failed
    /// replay). Not otherwise actionable, but useful for logging/tests.
    pub rejected: usize,
}

pub struct ChainStore {
    blocks: HashMap<BlockId, Block>,
    pending_by_missing_parent: HashMap<BlockId, Vec<Block>>,
    last_block_id: BlockId,
    last_confirmed_block_id: BlockId,
    confirmed_depth: u64,
}

impl ChainStore {
    pub fn new(genesis: Block, confirmed_depth: u64) -> Self {
        let id = genesis.id();
        let mut blocks = HashMap::new();
        blocks.insert(id, genesis);
        ChainStore {
            blocks,
            pending_by_missing_parent: HashMap::new(),
            last_block_id: id,
            last_confirmed_block_id: id,
            confirmed_depth,
        }
    }

    pub fn get(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn last_block(&self) -> &Block {
        self.blocks
            .get(&self.last_block_id)
            .expect("last_block_id always refers to a stored block")
    }

    pub fn last_confirmed_block(&self) -> &Block {
        self.blocks
            .get(&self.last_confirmed_block_id)
            .expect("last_confirmed_block_id always refers to a stored block")
    }

    pub fn last_block_id(&self) -> BlockId {
        self.last_block_id
    }

    /// Try to accept `block`, then recursively unblock any children that
    /// were buffered awaiting it. Idempotent: re-delivering a known
    /// block is a no-op beyond being reported as already known.
    pub fn receive_block(&mut self, block: Block) -> ReceiveReport {
        let mut report = ReceiveReport::default();
        let mut queue = VecDeque::new();
        queue.push_back(block);

        while let Some(candidate) = queue.pop_front() {
            match self.accept_one(candidate) {
                AcceptOutcome::AlreadyKnown => {}
                AcceptOutcome::InvalidProof | AcceptOutcome::ReplayFailed => {
                    report.rejected += 1;
                }
                AcceptOutcome::MissingParent {
                    missing,
                    first_for_parent,
                } => {
                    if first_for_parent {
                        report.missing_block_requests.push(missing);
                    }
                }
                AcceptOutcome::Accepted(id) => {
                    report.accepted.push(id);
                    if let Some(children) = self.pending_by_missing_parent.remove(&id) {
                        queue.extend(children);
                    }
                }
            }
        }

        report
    }

    fn accept_one(&mut self, mut block: Block) -> AcceptOutcome {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return AcceptOutcome::AlreadyKnown;
        }

        let is_genesis = block.prev_block_hash.is_none();
        if !is_genesis && !block.has_valid_proof() {
            return AcceptOutcome::InvalidProof;
        }

        if !is_genesis {
            let parent_id = block.prev_block_hash.expect("checked above");
            let parent = match self.blocks.get(&parent_id) {
                Some(p) => p.clone(),
                None => {
                    let entry = self
                        .pending_by_missing_parent
                        .entry(parent_id)
                        .or_default();
                    let first_for_parent = entry.is_empty();
                    entry.push(block);
                    return AcceptOutcome::MissingParent {
                        missing: parent_id,
                        first_for_parent,
                    };
                }
            };
            if block.rerun(&parent).is_err() {
                return AcceptOutcome::ReplayFailed;
            }
        }

        self.blocks.insert(id, block);
        let chain_length = self.blocks[&id].chain_length;
        if chain_length > self.last_block().chain_length {
            self.last_block_id = id;
            self.recompute_last_confirmed();
        }
        AcceptOutcome::Accepted(id)
    }

    fn recompute_last_confirmed(&mut self) {
        let mut id = self.last_block_id;
        for _ in 0..self.confirmed_depth {
            let block = &self.blocks[&id];
            match block.prev_block_hash {
                Some(parent) => id = parent,
                None => break,
            }
        }
        self.last_confirmed_block_id = id;
    }
}
