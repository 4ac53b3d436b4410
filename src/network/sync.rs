//! Peer synchronization.
//!
//! Each round against a peer walks a small state machine:
//!
//! ```text
//! Idle -> Querying -> Comparing -> { InSync | Behind | PossibleFork }
//! ```
//!
//! - **Querying** fetches the peer's status.
//! - **Comparing** checks the peer's tip number against the local one, and
//!   the peer's block at the local height against the local tip.
//! - **Behind**: the peer's chain extends ours. Missing blocks are fetched by
//!   number and handed to the node as one segment.
//! - **PossibleFork**: the chains diverge. The last common ancestor is found
//!   by comparing block hashes downwards, then the peer's blocks after it are
//!   offered to the node, which adopts them only if the result is strictly
//!   longer and fully valid.
//!
//! A peer's reported height is never trusted for sizing: one round fetches at
//! most [`MAX_BLOCKS_PER_ROUND`] blocks past the ancestor and stops at the
//! first short batch. Later rounds continue from the new tip.
//!
//! Fetch failures abort the round and are retried on the next tick; local
//! state only changes through [`Node::apply_segment`], which is all or
//! nothing. A peer unreachable for [`MAX_FAILED_ROUNDS`] rounds in a row is
//! forgotten.

use crate::core::block::Block;
use crate::core::node::{Node, NodeError, SegmentOutcome};
use crate::network::message::{MAX_BLOCKS_PER_RESPONSE, Request};
use crate::network::peer::{
    Peer, PeerClient, PeerError, fetch_block_batch, fetch_blocks, fetch_status, notify,
};
use crate::{debug, info, warn};
use dashmap::DashMap;
use powchain_derive::Error;
use std::sync::Arc;

/// Most blocks fetched past the common ancestor in one round.
pub const MAX_BLOCKS_PER_ROUND: u64 = 10 * MAX_BLOCKS_PER_RESPONSE;
/// Consecutive unreachable rounds after which a peer is dropped.
pub const MAX_FAILED_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Querying,
    Comparing,
    InSync,
    Behind,
    PossibleFork,
}

/// What a finished round changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do: same tip, or the peer is behind.
    InSync,
    /// The local chain was extended or replaced.
    Adopted(SegmentOutcome),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Peer(#[source] PeerError),

    #[error("{0}")]
    Node(#[source] NodeError),

    #[error("peer {host} shares no common ancestor with the local chain")]
    NoCommonAncestor { host: String },

    #[error("sync task failed: {0}")]
    Task(String),
}

impl From<PeerError> for SyncError {
    fn from(err: PeerError) -> Self {
        SyncError::Peer(err)
    }
}

impl From<NodeError> for SyncError {
    fn from(err: NodeError) -> Self {
        SyncError::Node(err)
    }
}

pub struct Synchronizer {
    node: Arc<Node>,
    client: Arc<dyn PeerClient>,
    states: DashMap<String, SyncState>,
    failures: DashMap<String, u32>,
}

impl Synchronizer {
    pub fn new(node: Arc<Node>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            node,
            client,
            states: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// State reached by the latest round against `host`.
    pub fn state(&self, host: &str) -> SyncState {
        self.states.get(host).map(|s| *s).unwrap_or(SyncState::Idle)
    }

    fn transition(&self, peer: &Peer, state: SyncState) {
        debug!("Sync with {}: {:?}", peer.host, state);
        self.states.insert(peer.host.clone(), state);
    }

    fn record_unreachable(&self, peer: &Peer, err: &PeerError) {
        let failures = {
            let mut count = self.failures.entry(peer.host.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if failures < MAX_FAILED_ROUNDS {
            warn!("Sync with {} failed ({failures} in a row): {err}", peer.host);
            return;
        }
        warn!("Peer {} unreachable for {failures} rounds, dropping it", peer.host);
        self.failures.remove(&peer.host);
        self.states.remove(&peer.host);
        self.node.forget_peer(&peer.host);
    }

    /// One sync round against every known peer, plus peer discovery: each
    /// peer learns about this node and shares the peers it knows.
    pub async fn tick(&self) {
        let me = Peer::new(self.node.host());
        for peer in self.node.peers() {
            if let Err(e) = notify(&*self.client, &peer, Request::SubmitPeer(me.clone())).await {
                debug!("Could not announce to {}: {e}", peer.host);
            }
            match self.sync_with(&peer).await {
                Ok(SyncOutcome::InSync) => {}
                Ok(SyncOutcome::Adopted(outcome)) => {
                    info!("Synced with {} up to block #{}", peer.host, outcome.new_height)
                }
                Err(SyncError::Peer(e @ PeerError::Unreachable { .. })) => {
                    self.record_unreachable(&peer, &e)
                }
                Err(SyncError::Peer(e)) => warn!("Sync with {} failed: {e}", peer.host),
                Err(e) => warn!("Rejected chain from {}: {e}", peer.host),
            }
        }
    }

    /// Runs one round against `peer`.
    pub async fn sync_with(&self, peer: &Peer) -> Result<SyncOutcome, SyncError> {
        self.transition(peer, SyncState::Querying);
        let status = match fetch_status(&*self.client, peer).await {
            Ok(status) => status,
            Err(e) => {
                self.transition(peer, SyncState::Idle);
                return Err(e.into());
            }
        };
        self.failures.remove(&peer.host);
        for known in status.known_peers {
            self.node.submit_peer(known);
        }

        self.transition(peer, SyncState::Comparing);
        let local_height = self.node.height();
        let remote_height = status.latest_block_number;

        if remote_height < local_height {
            self.transition(peer, SyncState::InSync);
            return Ok(SyncOutcome::InSync);
        }
        if remote_height == local_height {
            if Some(status.latest_block_hash) == self.node.hash_at(local_height) {
                self.transition(peer, SyncState::InSync);
                return Ok(SyncOutcome::InSync);
            }
            // Equal length can never win fork choice; no need to fetch.
            self.transition(peer, SyncState::PossibleFork);
            return Err(NodeError::ChainConflict(format!(
                "peer {} holds a different block #{remote_height}",
                peer.host
            ))
            .into());
        }

        let remote_at_local = fetch_blocks(&*self.client, peer, local_height, local_height).await?;
        let ancestor = if Some(remote_at_local[0].hash()) == self.node.hash_at(local_height) {
            self.transition(peer, SyncState::Behind);
            local_height
        } else {
            self.transition(peer, SyncState::PossibleFork);
            self.find_common_ancestor(peer, local_height).await?
        };

        // Always enough to outgrow the local chain, never more than a round.
        let target = remote_height.min(
            ancestor
                .saturating_add(MAX_BLOCKS_PER_ROUND)
                .max(local_height + 1),
        );
        let segment = self.fetch_range(peer, ancestor + 1, target).await?;
        if segment.is_empty() {
            return Err(PeerError::Protocol {
                host: peer.host.clone(),
                reason: format!("reports block #{remote_height} but served none after #{ancestor}"),
            }
            .into());
        }

        let node = Arc::clone(&self.node);
        let outcome = tokio::task::spawn_blocking(move || node.apply_segment(ancestor, segment))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;
        Ok(SyncOutcome::Adopted(outcome))
    }

    /// Highest block number at which both chains hold the same hash,
    /// searching downwards from `below` (exclusive) in response-sized windows.
    async fn find_common_ancestor(&self, peer: &Peer, below: u64) -> Result<u64, SyncError> {
        let mut hi = below;
        while hi > 0 {
            let top = hi - 1;
            let bottom = top.saturating_sub(MAX_BLOCKS_PER_RESPONSE - 1);
            let window = fetch_blocks(&*self.client, peer, bottom, top).await?;
            for block in window.iter().rev() {
                if Some(block.hash()) == self.node.hash_at(block.number()) {
                    debug!("Common ancestor with {} at block #{}", peer.host, block.number());
                    return Ok(block.number());
                }
            }
            hi = bottom;
        }
        Err(SyncError::NoCommonAncestor {
            host: peer.host.clone(),
        })
    }

    /// Blocks `from..=to` in response-sized batches, ending early at the
    /// first short batch.
    async fn fetch_range(&self, peer: &Peer, from: u64, to: u64) -> Result<Vec<Block>, SyncError> {
        let mut blocks = Vec::new();
        let mut start = from;
        while start <= to {
            let end = to.min(start.saturating_add(MAX_BLOCKS_PER_RESPONSE - 1));
            let batch = fetch_block_batch(&*self.client, peer, start, end).await?;
            let complete = batch.len() as u64 == end - start + 1;
            blocks.extend(batch);
            if !complete || end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(blocks)
    }
}
