//! Candidate block assembly and the cancellable proof-of-work search.
//!
//! Assembly runs on a scratch ledger so nothing shared changes until the
//! owning [`Node`](crate::core::node::Node) commits the solved block. Both
//! roots are computed before the search because they are part of the
//! hashed header.

use crate::core::block::Header;
use crate::core::ledger::Ledger;
use crate::core::transaction::{SignedTransaction, TxError};
use crate::core::validator::{BlockError, BlockValidator};
use crate::types::address::Address;
use crate::types::merkle_tree::MerkleTree;
use rand_core::{OsRng, RngCore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hash attempts between two checks of the cancellation flag.
pub const CANCEL_POLL_INTERVAL: u64 = 1024;

/// Shared flag telling a running search to stop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A block waiting for its proof-of-work.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Header with both roots filled in; `nonce` is the search start.
    pub header: Header,
    pub transactions: Vec<SignedTransaction>,
    /// Scratch ledger after applying `transactions` and the reward.
    pub ledger: Ledger,
    /// Picked transactions that failed against the scratch ledger.
    pub dropped: Vec<(SignedTransaction, TxError)>,
}

/// Builds the child of `parent` from `picked`, applying each transaction to
/// `ledger` in order and dropping only the ones that fail.
pub fn assemble(
    validator: &BlockValidator,
    parent: &Header,
    picked: Vec<SignedTransaction>,
    mut ledger: Ledger,
    beneficiary: Address,
    timestamp: u64,
) -> Result<Candidate, BlockError> {
    let mut transactions = Vec::with_capacity(picked.len());
    let mut dropped = Vec::new();

    for tx in picked.into_iter().take(validator.trans_per_block()) {
        match tx
            .validate(validator.chain_id())
            .and_then(|_| ledger.apply(&tx, &beneficiary))
        {
            Ok(()) => transactions.push(tx),
            Err(err) => dropped.push((tx, err)),
        }
    }
    validator.apply_reward(&mut ledger, beneficiary)?;

    let header = Header {
        number: parent.number + 1,
        previous_hash: parent.hash(),
        // Keep timestamps monotonic even if the local clock steps back.
        timestamp: timestamp.max(parent.timestamp),
        beneficiary,
        difficulty: validator.difficulty(),
        nonce: OsRng.next_u64(),
        transaction_root: MerkleTree::from_transactions(&transactions),
        state_root: ledger.snapshot(),
    };

    Ok(Candidate {
        header,
        transactions,
        ledger,
        dropped,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Header),
    Cancelled,
    /// Every nonce was tried without success.
    Exhausted,
}

/// Increments `header.nonce` until the hash meets `header.difficulty`,
/// polling `cancel` every [`CANCEL_POLL_INTERVAL`] attempts. Blocking; run it
/// off the async runtime.
pub fn search(mut header: Header, cancel: &CancelToken) -> SearchOutcome {
    let start = header.nonce;
    let mut attempts: u64 = 0;

    loop {
        if attempts % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            return SearchOutcome::Cancelled;
        }
        if header.has_valid_work() {
            return SearchOutcome::Found(header);
        }
        header.nonce = header.nonce.wrapping_add(1);
        attempts += 1;
        if header.nonce == start {
            return SearchOutcome::Exhausted;
        }
    }
}
