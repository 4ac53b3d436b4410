//! Key management and recoverable signatures.

pub mod key_pair;
