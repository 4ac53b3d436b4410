//! Node storage.
//!
//! - [`block_store`]: durable, append-only log of committed blocks
//! - [`mempool`]: pending transactions awaiting inclusion

pub mod block_store;
pub mod mempool;
