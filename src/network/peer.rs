//! Peer records and the request/response seams between nodes.
//!
//! A peer is advisory: it can offer blocks and transactions but never has
//! authority over the local chain. [`PeerClient`] sends one request and waits
//! for one response; [`RequestHandler`] answers them. Both are implemented
//! over TCP and in memory.

use crate::core::block::Block;
use crate::network::message::{Request, Response};
use crate::types::hash::Hash;
use crate::types::wrapper_types::BoxFuture;
use dashmap::DashMap;
use powchain_derive::{BinaryCodec, Error};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, BinaryCodec)]
pub struct Peer {
    /// `ip:port` the peer listens on.
    pub host: String,
}

impl Peer {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct PeerStatus {
    pub latest_block_hash: Hash,
    pub latest_block_number: u64,
    pub known_peers: Vec<Peer>,
}

/// Upper bound on the known-peer set.
pub const MAX_KNOWN_PEERS: usize = 64;

/// De-duplicated, bounded set of known peers.
#[derive(Debug)]
pub struct PeerSet {
    peers: DashMap<String, Peer>,
    capacity: usize,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::with_capacity(MAX_KNOWN_PEERS)
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: DashMap::new(),
            capacity,
        }
    }

    /// Returns false if the host was already known or the set is full.
    pub fn insert(&self, peer: Peer) -> bool {
        if self.peers.len() >= self.capacity && !self.peers.contains_key(&peer.host) {
            return false;
        }
        self.peers.insert(peer.host.clone(), peer).is_none()
    }

    pub fn remove(&self, host: &str) -> bool {
        self.peers.remove(host).is_some()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.peers.contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Known peers sorted by host.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort();
        peers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Connection failure or timeout; retried on the next tick.
    #[error("peer {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("peer {host} broke protocol: {reason}")]
    Protocol { host: String, reason: String },

    #[error("peer {host} rejected the request: {reason}")]
    Rejected { host: String, reason: String },
}

/// Outbound side: one request, one response.
pub trait PeerClient: Send + Sync {
    fn request(
        &self,
        peer: &Peer,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, PeerError>>;
}

/// Inbound side: answers requests from peers and API callers.
pub trait RequestHandler: Send + Sync {
    fn handle(self: Arc<Self>, request: Request) -> BoxFuture<'static, Response>;
}

fn unexpected(peer: &Peer, response: Response) -> PeerError {
    match response {
        Response::Rejected(reason) => PeerError::Rejected {
            host: peer.host.clone(),
            reason,
        },
        other => PeerError::Protocol {
            host: peer.host.clone(),
            reason: format!("unexpected response {}", other.kind()),
        },
    }
}

pub async fn fetch_status(client: &dyn PeerClient, peer: &Peer) -> Result<PeerStatus, PeerError> {
    match client.request(peer, Request::Status).await? {
        Response::Status(status) => Ok(status),
        other => Err(unexpected(peer, other)),
    }
}

/// Up to `from..=to` from `peer`: a consecutive run starting at `from`,
/// possibly shorter than asked when the peer holds fewer blocks.
pub async fn fetch_block_batch(
    client: &dyn PeerClient,
    peer: &Peer,
    from: u64,
    to: u64,
) -> Result<Vec<Block>, PeerError> {
    let blocks = match client.request(peer, Request::BlocksByNumber { from, to }).await? {
        Response::Blocks(blocks) => blocks,
        other => return Err(unexpected(peer, other)),
    };
    let in_order = blocks
        .iter()
        .zip(from..)
        .all(|(block, number)| block.number() == number);
    if blocks.len() as u64 > to.saturating_sub(from).saturating_add(1) || !in_order {
        return Err(PeerError::Protocol {
            host: peer.host.clone(),
            reason: format!("asked for blocks #{from}..#{to}, got an unordered or oversized batch"),
        });
    }
    Ok(blocks)
}

/// Blocks `from..=to` from `peer`. Fails unless every requested block arrives
/// in order.
pub async fn fetch_blocks(
    client: &dyn PeerClient,
    peer: &Peer,
    from: u64,
    to: u64,
) -> Result<Vec<Block>, PeerError> {
    let blocks = fetch_block_batch(client, peer, from, to).await?;
    if blocks.len() as u64 != to.saturating_sub(from).saturating_add(1) {
        return Err(PeerError::Protocol {
            host: peer.host.clone(),
            reason: format!("asked for blocks #{from}..#{to}, got {}", blocks.len()),
        });
    }
    Ok(blocks)
}

/// Sends a request whose only useful answer is `Ack`.
pub async fn notify(
    client: &dyn PeerClient,
    peer: &Peer,
    request: Request,
) -> Result<(), PeerError> {
    match client.request(peer, request).await? {
        Response::Ack => Ok(()),
        other => Err(unexpected(peer, other)),
    }
}
