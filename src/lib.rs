//! Proof-of-work blockchain node library.
//!
//! Provides the account ledger, transaction signing, mempool, chain and
//! miner, plus the networking that keeps nodes synchronized.

pub mod config;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod types;
pub mod utils;
