//! Block header and block structures.

use crate::core::transaction::SignedTransaction;
use crate::types::address::Address;
use crate::types::hash::Hash;
use powchain_derive::BinaryCodec;
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER_HASH_TAG: &[u8] = b"POWCHAIN_BLOCK_HEADER";

/// Everything the proof-of-work commits to.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct Header {
    /// Position in the chain; genesis is 0.
    pub number: u64,
    /// Hash of the parent header.
    pub previous_hash: Hash,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Receives tips and the mining reward.
    pub beneficiary: Address,
    /// Required leading zero bits of this header's hash.
    pub difficulty: u8,
    /// Proof-of-work counter.
    pub nonce: u64,
    /// Merkle root of the transaction ids.
    pub transaction_root: Hash,
    /// Ledger snapshot after applying this block.
    pub state_root: Hash,
}

impl Header {
    pub fn hash(&self) -> Hash {
        Hash::tagged(HEADER_HASH_TAG, self)
    }

    /// True if the header hash satisfies its own difficulty.
    pub fn has_valid_work(&self) -> bool {
        self.hash().meets_difficulty(self.difficulty)
    }
}

/// Header plus the ordered transactions it commits to. Never modified after
/// it is mined or accepted; shared as `Arc<Block>`.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<SignedTransaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<SignedTransaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
