//! Chain parameters and the deterministic genesis block.

use crate::core::block::{Block, Header};
use crate::core::ledger::Ledger;
use crate::core::transaction::TxError;
use crate::types::address::Address;
use crate::types::hash::Hash;
use powchain_derive::BinaryCodec;

pub const DEFAULT_CHAIN_ID: u16 = 1;
pub const DEFAULT_DIFFICULTY: u8 = 16;
pub const DEFAULT_TRANS_PER_BLOCK: usize = 10;

/// Parameters every node on a chain must agree on.
///
/// Two nodes with equal `Genesis` values derive byte-identical genesis
/// blocks, so they can exchange blocks from height 1 on.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct Genesis {
    pub chain_id: u16,
    /// Genesis block timestamp, milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Leading zero bits every non-genesis header hash must have.
    pub difficulty: u8,
    pub trans_per_block: usize,
    /// Credited to the beneficiary after each block's transactions.
    pub mining_reward: u64,
    pub balances: Vec<(Address, u64)>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            timestamp: 0,
            difficulty: DEFAULT_DIFFICULTY,
            trans_per_block: DEFAULT_TRANS_PER_BLOCK,
            mining_reward: 0,
            balances: Vec::new(),
        }
    }
}

impl Genesis {
    pub fn ledger(&self) -> Result<Ledger, TxError> {
        let mut ledger = Ledger::new();
        for (address, balance) in &self.balances {
            ledger.credit(*address, *balance)?;
        }
        Ok(ledger)
    }

    /// Block 0. Carries no transactions and is never checked for work.
    pub fn block(&self) -> Result<Block, TxError> {
        let header = Header {
            number: 0,
            previous_hash: Hash::zero(),
            timestamp: self.timestamp,
            beneficiary: Address::zero(),
            difficulty: self.difficulty,
            nonce: 0,
            transaction_root: Hash::zero(),
            state_root: self.ledger()?.snapshot(),
        };
        Ok(Block::new(header, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis(balance: u64) -> Genesis {
        Genesis {
            balances: vec![(Address([1; 20]), balance)],
            ..Genesis::default()
        }
    }

    #[test]
    fn genesis_block_is_deterministic() {
        assert_eq!(genesis(5).block().unwrap().hash(), genesis(5).block().unwrap().hash());
        assert_ne!(genesis(5).block().unwrap().hash(), genesis(6).block().unwrap().hash());
    }

    #[test]
    fn genesis_state_root_matches_ledger() {
        let g = genesis(5);
        assert_eq!(g.block().unwrap().header.state_root, g.ledger().unwrap().snapshot());
        assert_eq!(g.ledger().unwrap().balance(&Address([1; 20])), 5);
    }

    #[test]
    fn duplicate_funding_accumulates() {
        let g = Genesis {
            balances: vec![(Address([1; 20]), 5), (Address([1; 20]), 7)],
            ..Genesis::default()
        };
        assert_eq!(g.ledger().unwrap().balance(&Address([1; 20])), 12);
    }
}
