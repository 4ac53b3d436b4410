//! Block validation rules.
//!
//! [`BlockValidator::validate_next`] is the single acceptance path for blocks
//! that did not come out of the local miner: peer-proposed blocks, synced
//! ranges, fork segments and blocks replayed from disk.

use crate::core::block::{Block, Header};
use crate::core::genesis::Genesis;
use crate::core::ledger::Ledger;
use crate::core::transaction::TxError;
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use powchain_derive::Error;

/// How far a block timestamp may run ahead of the local clock.
pub const MAX_BLOCK_TIME_DRIFT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("invalid block number: expected {expected}, got {actual}")]
    InvalidNumber { expected: u64, actual: u64 },

    #[error("previous hash mismatch: expected {expected}, got {actual}")]
    PreviousHashMismatch { expected: Hash, actual: Hash },

    #[error("wrong difficulty: expected {expected}, got {actual}")]
    WrongDifficulty { expected: u8, actual: u8 },

    #[error("header hash {hash} does not meet difficulty {difficulty}")]
    InsufficientWork { hash: Hash, difficulty: u8 },

    #[error("timestamp {timestamp} is too far ahead of local time {now}")]
    TimestampTooFarAhead { timestamp: u64, now: u64 },

    #[error("block holds {count} transactions, limit is {limit}")]
    TooManyTransactions { count: usize, limit: usize },

    #[error("transaction root mismatch")]
    TransactionRootMismatch,

    #[error("state root mismatch: header {expected}, computed {actual}")]
    StateRootMismatch { expected: Hash, actual: Hash },

    #[error("transaction {index} is invalid: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: TxError,
    },

    #[error("mining reward overflows the beneficiary balance")]
    RewardOverflow,
}

/// Consensus parameters taken from the genesis configuration.
#[derive(Clone, Debug)]
pub struct BlockValidator {
    chain_id: u16,
    difficulty: u8,
    trans_per_block: usize,
    mining_reward: u64,
}

impl BlockValidator {
    pub fn new(genesis: &Genesis) -> Self {
        Self {
            chain_id: genesis.chain_id,
            difficulty: genesis.difficulty,
            trans_per_block: genesis.trans_per_block,
            mining_reward: genesis.mining_reward,
        }
    }

    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    pub fn trans_per_block(&self) -> usize {
        self.trans_per_block
    }

    /// Checks that do not need the ledger: linkage, difficulty, work and time.
    pub fn validate_header(
        &self,
        header: &Header,
        parent: &Header,
        now_ms: u64,
    ) -> Result<(), BlockError> {
        let expected = parent.number + 1;
        if header.number != expected {
            return Err(BlockError::InvalidNumber {
                expected,
                actual: header.number,
            });
        }

        let parent_hash = parent.hash();
        if header.previous_hash != parent_hash {
            return Err(BlockError::PreviousHashMismatch {
                expected: parent_hash,
                actual: header.previous_hash,
            });
        }

        if header.difficulty != self.difficulty {
            return Err(BlockError::WrongDifficulty {
                expected: self.difficulty,
                actual: header.difficulty,
            });
        }

        if !header.has_valid_work() {
            return Err(BlockError::InsufficientWork {
                hash: header.hash(),
                difficulty: header.difficulty,
            });
        }

        if header.timestamp > now_ms.saturating_add(MAX_BLOCK_TIME_DRIFT_MS) {
            return Err(BlockError::TimestampTooFarAhead {
                timestamp: header.timestamp,
                now: now_ms,
            });
        }

        Ok(())
    }

    /// Validates `block` as the child of `parent` and applies it to `ledger`.
    ///
    /// `ledger` must hold the state after `parent`. On error it may be left
    /// partially updated, so callers validate against a scratch copy.
    pub fn validate_next(
        &self,
        block: &Block,
        parent: &Header,
        ledger: &mut Ledger,
        now_ms: u64,
    ) -> Result<(), BlockError> {
        let header = &block.header;
        self.validate_header(header, parent, now_ms)?;

        if block.transactions.len() > self.trans_per_block {
            return Err(BlockError::TooManyTransactions {
                count: block.transactions.len(),
                limit: self.trans_per_block,
            });
        }

        if MerkleTree::from_transactions(&block.transactions) != header.transaction_root {
            return Err(BlockError::TransactionRootMismatch);
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            tx.validate(self.chain_id)
                .and_then(|_| ledger.apply(tx, &header.beneficiary))
                .map_err(|source| BlockError::InvalidTransaction { index, source })?;
        }
        self.apply_reward(ledger, header.beneficiary)?;

        let actual = ledger.snapshot();
        if actual != header.state_root {
            return Err(BlockError::StateRootMismatch {
                expected: header.state_root,
                actual,
            });
        }

        Ok(())
    }

    /// Credits the per-block mining reward. Shared with block assembly so
    /// that miners and validators compute the same state root.
    pub fn apply_reward(
        &self,
        ledger: &mut Ledger,
        beneficiary: Address,
    ) -> Result<(), BlockError> {
        ledger
            .credit(beneficiary, self.mining_reward)
            .map_err(|_| BlockError::RewardOverflow)
    }
}
