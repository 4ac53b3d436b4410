//! Wire messages exchanged between nodes and with API callers.
//!
//! Every connection carries length-framed [`Request`]/[`Response`] pairs
//! encoded with the binary codec.

use crate::core::account::AccountInfo;
use crate::core::block::Block;
use crate::core::transaction::SignedTransaction;
use crate::network::peer::{Peer, PeerStatus};
use crate::types::address::Address;
use powchain_derive::BinaryCodec;

/// Most blocks a single `BlocksByNumber` response carries.
pub const MAX_BLOCKS_PER_RESPONSE: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Request {
    /// Tip hash, tip number and known peers.
    Status,
    /// Blocks `from..=to`; `u64::MAX` means the tip.
    BlocksByNumber { from: u64, to: u64 },
    /// Announces a peer. Best effort, de-duplicated.
    SubmitPeer(Peer),
    /// A transaction from an API caller. Forwarded to known peers on success.
    SubmitTransaction(SignedTransaction),
    /// A transaction gossiped by a peer. Never forwarded again.
    ShareTransaction(SignedTransaction),
    /// A block the sender just mined or accepted.
    ProposeBlock(Block),
    /// One account, or all non-empty accounts.
    QueryAccounts(Option<Address>),
    QueryMempool,
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub enum Response {
    Status(PeerStatus),
    Blocks(Vec<Block>),
    Accounts(Vec<AccountInfo>),
    Transactions(Vec<SignedTransaction>),
    Ack,
    Rejected(String),
}

impl Response {
    /// Variant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Status(_) => "Status",
            Response::Blocks(_) => "Blocks",
            Response::Accounts(_) => "Accounts",
            Response::Transactions(_) => "Transactions",
            Response::Ack => "Ack",
            Response::Rejected(_) => "Rejected",
        }
    }
}
