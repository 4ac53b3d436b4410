//! The committed chain as an indexed, append-only sequence.
//!
//! Blocks live in a `Vec` at the index equal to their number, so lookups,
//! ranges and fork truncation are plain slice operations.

use crate::core::block::{Block, Header, now_millis};
use crate::core::genesis::Genesis;
use crate::core::ledger::Ledger;
use crate::core::validator::{BlockError, BlockValidator};
use crate::types::hash::Hash;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Chain {
    /// Never empty: index 0 is the genesis block.
    blocks: Vec<Arc<Block>>,
}

impl Chain {
    pub fn new(genesis: Block) -> Self {
        Self {
            blocks: vec![Arc::new(genesis)],
        }
    }

    pub fn tip(&self) -> &Arc<Block> {
        // `blocks` always holds at least genesis.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_header(&self) -> &Header {
        &self.tip().header
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip().hash()
    }

    /// Number of the tip block.
    pub fn height(&self) -> u64 {
        (self.blocks.len() - 1) as u64
    }

    pub fn get(&self, number: u64) -> Option<&Arc<Block>> {
        usize::try_from(number).ok().and_then(|i| self.blocks.get(i))
    }

    pub fn hash_at(&self, number: u64) -> Option<Hash> {
        self.get(number).map(|b| b.hash())
    }

    /// Blocks `from..=to`, clipped to the tip. Empty if `from > to` or
    /// `from` is past the tip.
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<Block>> {
        let to = to.min(self.height());
        if from > to {
            return Vec::new();
        }
        self.blocks[from as usize..=to as usize].to_vec()
    }

    /// Appends a block already validated against the tip.
    pub fn push(&mut self, block: Arc<Block>) -> Result<(), BlockError> {
        let tip = self.tip_header();
        if block.number() != tip.number + 1 {
            return Err(BlockError::InvalidNumber {
                expected: tip.number + 1,
                actual: block.number(),
            });
        }
        let tip_hash = tip.hash();
        if block.header.previous_hash != tip_hash {
            return Err(BlockError::PreviousHashMismatch {
                expected: tip_hash,
                actual: block.header.previous_hash,
            });
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Keeps blocks `0..=height` and returns the removed suffix in order.
    pub fn truncate(&mut self, height: u64) -> Vec<Arc<Block>> {
        if height >= self.height() {
            return Vec::new();
        }
        self.blocks.split_off(height as usize + 1)
    }

    /// Non-genesis blocks in order.
    pub fn blocks_after_genesis(&self) -> &[Arc<Block>] {
        &self.blocks[1..]
    }

    /// Rebuilds a chain and its ledger from genesis, fully validating every
    /// block. Stops at the first invalid block.
    pub fn replay<'a, I>(genesis: &Genesis, blocks: I) -> Result<(Chain, Ledger), ReplayError>
    where
        I: IntoIterator<Item = &'a Arc<Block>>,
    {
        let genesis_error = |source| ReplayError {
            valid: 0,
            number: 0,
            source: BlockError::InvalidTransaction { index: 0, source },
        };
        let genesis_block = genesis.block().map_err(genesis_error)?;
        let mut ledger = genesis.ledger().map_err(genesis_error)?;
        let mut chain = Chain::new(genesis_block);
        let validator = BlockValidator::new(genesis);
        let now = now_millis();

        for (valid, block) in blocks.into_iter().enumerate() {
            validator
                .validate_next(block, chain.tip_header(), &mut ledger, now)
                .and_then(|_| chain.push(Arc::clone(block)))
                .map_err(|source| ReplayError {
                    valid,
                    number: block.number(),
                    source,
                })?;
        }

        Ok((chain, ledger))
    }
}

/// Where a replay stopped.
#[derive(Debug)]
pub struct ReplayError {
    /// Count of leading input blocks that replayed cleanly.
    pub valid: usize,
    /// Number claimed by the failing block's header.
    pub number: u64,
    pub source: BlockError,
}
