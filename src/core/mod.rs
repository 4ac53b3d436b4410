//! Core chain data structures and rules.
//!
//! - [`transaction`]: transfers and their domain-separated signing
//! - [`ledger`]: balances and nonces, the only place transfers are applied
//! - [`block`], [`chain`], [`genesis`]: the hash-linked block sequence
//! - [`validator`]: block acceptance rules
//! - [`miner`]: candidate assembly and the cancellable proof-of-work search
//! - [`node`]: the single-writer owner of ledger, chain and mempool

pub mod account;
pub mod block;
pub mod chain;
pub mod genesis;
pub mod ledger;
pub mod miner;
pub mod node;
pub mod transaction;
pub mod validator;
