//! The node's shared state and the single mutation path into it.
//!
//! Ledger, chain, mempool and block store sit behind one `RwLock`. Every
//! state change (admitting a transaction, committing a mined block,
//! accepting a proposed block, adopting a peer segment) runs under the write
//! lock, so their effects never interleave. Queries take the read lock and
//! see a consistent snapshot.
//!
//! Proof-of-work runs outside the lock: [`Node::prepare_candidate`] builds
//! the candidate under a read lock, the search runs unlocked, and
//! [`Node::commit_candidate`] re-checks the tip under the write lock. Every
//! other commit cancels the running search first.

use crate::core::account::AccountInfo;
use crate::core::block::{Block, Header, now_millis};
use crate::core::chain::{Chain, ReplayError};
use crate::core::genesis::Genesis;
use crate::core::ledger::Ledger;
use crate::core::miner::{CancelToken, Candidate, SearchOutcome, assemble, search};
use crate::core::transaction::{SignedTransaction, TxError};
use crate::core::validator::{BlockError, BlockValidator};
use crate::network::peer::{Peer, PeerSet, PeerStatus};
use crate::storage::block_store::{BlockStore, StorageError};
use crate::storage::mempool::{Admission, MEMPOOL_CAPACITY, Mempool, MempoolError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::{debug, info, warn};
use powchain_derive::Error;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Block number that resolves to the current tip in range queries.
pub const QUERY_LATEST: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid genesis configuration: {0}")]
    InvalidGenesis(#[source] TxError),

    #[error("invalid block {number}: {source}")]
    InvalidBlock {
        number: u64,
        #[source]
        source: BlockError,
    },

    #[error("chain conflict: {0}")]
    ChainConflict(String),

    #[error("candidate block is stale: the chain tip moved during the search")]
    StaleCandidate,

    #[error("block store failure: {0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for NodeError {
    fn from(err: StorageError) -> Self {
        NodeError::Storage(err)
    }
}

impl From<ReplayError> for NodeError {
    fn from(err: ReplayError) -> Self {
        NodeError::InvalidBlock {
            number: err.number,
            source: err.source,
        }
    }
}

/// Result of one local mining attempt.
#[derive(Debug, Clone)]
pub enum MineOutcome {
    Mined(Arc<Block>),
    /// Another block was committed during the search.
    Cancelled,
    /// The search finished but the tip had already moved.
    Stale,
    /// The whole nonce space was tried without success.
    Exhausted,
}

/// Result of offering a single block that a peer proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// The block extended the tip and is now committed.
    Committed,
    /// The block is already part of the local chain.
    Known,
    /// The block does not extend the local tip; only a sync can place it.
    Detached,
}

/// What adopting a peer segment changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub ancestor: u64,
    pub new_height: u64,
    /// Local blocks discarded in favour of the peer's.
    pub orphaned: usize,
}

struct Inner {
    ledger: Ledger,
    chain: Chain,
    mempool: Mempool,
    store: Box<dyn BlockStore>,
}

pub struct Node {
    genesis: Genesis,
    validator: BlockValidator,
    beneficiary: Address,
    host: String,
    inner: RwLock<Inner>,
    peers: PeerSet,
    mining: Mutex<Option<CancelToken>>,
}

impl Node {
    /// Builds the node and restores whatever valid prefix `store` holds.
    ///
    /// Stored blocks are replayed through the validator. The first block that
    /// fails ends the replay and the store is cut back to the valid prefix.
    pub fn new(
        genesis: Genesis,
        beneficiary: Address,
        host: String,
        store: Box<dyn BlockStore>,
    ) -> Result<Self, NodeError> {
        let genesis_block = genesis.block().map_err(NodeError::InvalidGenesis)?;
        let stored: Vec<Arc<Block>> = store.load()?.into_iter().map(Arc::new).collect();

        let (chain, ledger) = match Chain::replay(&genesis, &stored) {
            Ok(restored) => restored,
            Err(err) => {
                warn!(
                    "Stored block {} of {} (#{}) is invalid ({}), keeping the first {}",
                    err.valid + 1,
                    stored.len(),
                    err.number,
                    err.source,
                    err.valid
                );
                store.truncate(err.valid as u64)?;
                Chain::replay(&genesis, &stored[..err.valid])?
            }
        };

        info!(
            "Chain {} ready at block #{} {} (genesis {})",
            genesis.chain_id,
            chain.height(),
            chain.tip_hash(),
            genesis_block.hash()
        );

        Ok(Self {
            validator: BlockValidator::new(&genesis),
            inner: RwLock::new(Inner {
                mempool: Mempool::new(genesis.chain_id, MEMPOOL_CAPACITY),
                ledger,
                chain,
                store,
            }),
            genesis,
            beneficiary,
            host,
            peers: PeerSet::new(),
            mining: Mutex::new(None),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.validator
    }

    /// Address this node advertises to peers.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn beneficiary(&self) -> Address {
        self.beneficiary
    }

    // ==================== Queries ====================

    pub fn height(&self) -> u64 {
        self.read().chain.height()
    }

    pub fn tip_hash(&self) -> Hash {
        self.read().chain.tip_hash()
    }

    pub fn hash_at(&self, number: u64) -> Option<Hash> {
        self.read().chain.hash_at(number)
    }

    /// Blocks `from..=to`; [`QUERY_LATEST`] in either bound means the tip.
    pub fn query_blocks_by_number(&self, from: u64, to: u64) -> Vec<Arc<Block>> {
        let inner = self.read();
        let height = inner.chain.height();
        let resolve = |n: u64| if n == QUERY_LATEST { height } else { n };
        inner.chain.range(resolve(from), resolve(to))
    }

    pub fn query_mempool(&self) -> Vec<SignedTransaction> {
        self.read().mempool.transactions()
    }

    pub fn query_status(&self) -> PeerStatus {
        let inner = self.read();
        PeerStatus {
            latest_block_hash: inner.chain.tip_hash(),
            latest_block_number: inner.chain.height(),
            known_peers: self.peers.list(),
        }
    }

    /// One account, or every non-empty account when `address` is `None`.
    pub fn query_accounts(&self, address: Option<Address>) -> Vec<AccountInfo> {
        let inner = self.read();
        match address {
            Some(address) => {
                let account = inner.ledger.account(&address);
                vec![AccountInfo {
                    address,
                    balance: account.balance,
                    nonce: account.nonce,
                }]
            }
            None => inner.ledger.accounts(),
        }
    }

    pub fn chain_snapshot(&self) -> Chain {
        self.read().chain.clone()
    }

    pub fn ledger_snapshot(&self) -> Ledger {
        self.read().ledger.clone()
    }

    pub fn mempool_len(&self) -> usize {
        self.read().mempool.len()
    }

    // ==================== Peers ====================

    /// Adds a peer to the known set. Returns false for duplicates and for
    /// this node's own host.
    pub fn submit_peer(&self, peer: Peer) -> bool {
        if peer.host == self.host || peer.host.is_empty() {
            return false;
        }
        let added = self.peers.insert(peer.clone());
        if added {
            info!("Discovered peer {}", peer.host);
        }
        added
    }

    pub fn forget_peer(&self, host: &str) -> bool {
        let removed = self.peers.remove(host);
        if removed {
            info!("Forgot peer {host}");
        }
        removed
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.list()
    }

    // ==================== Transactions ====================

    pub fn submit_transaction(&self, tx: SignedTransaction) -> Result<Admission, MempoolError> {
        let mut inner = self.write();
        let inner = &mut *inner;
        let id = tx.id();
        match inner.mempool.add(tx, &inner.ledger) {
            Ok(admission) => {
                debug!("Admitted transaction {id} ({admission:?})");
                Ok(admission)
            }
            Err(err) => {
                debug!("Rejected transaction {id}: {err}");
                Err(err)
            }
        }
    }

    // ==================== Mining ====================

    /// Assembles a candidate on the current tip and registers the token that
    /// cancels its search.
    pub fn prepare_candidate(&self) -> Result<(Candidate, CancelToken), NodeError> {
        let inner = self.read();
        let parent = inner.chain.tip_header();
        let picked = inner.mempool.pick(self.validator.trans_per_block());
        let candidate = assemble(
            &self.validator,
            parent,
            picked,
            inner.ledger.clone(),
            self.beneficiary,
            now_millis(),
        )
        .map_err(|source| NodeError::InvalidBlock {
            number: parent.number + 1,
            source,
        })?;

        // Registered while the read lock is held, so any commit that follows
        // sees this token.
        let cancel = CancelToken::new();
        if let Some(previous) = self
            .mining
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(cancel.clone())
        {
            previous.cancel();
        }
        Ok((candidate, cancel))
    }

    /// Commits a solved candidate if the tip is still its parent.
    pub fn commit_candidate(
        &self,
        candidate: Candidate,
        header: Header,
    ) -> Result<Arc<Block>, NodeError> {
        let mut inner = self.write();
        if inner.chain.tip_hash() != header.previous_hash {
            return Err(NodeError::StaleCandidate);
        }

        let block = Arc::new(Block::new(header, candidate.transactions));
        inner.store.append(&block)?;
        inner
            .chain
            .push(Arc::clone(&block))
            .map_err(|source| NodeError::InvalidBlock {
                number: block.number(),
                source,
            })?;
        inner.ledger = candidate.ledger;

        let inner = &mut *inner;
        inner.mempool.remove(&block.transactions);
        // Future-nonce transactions stay pending; everything else that failed
        // assembly cannot succeed later.
        let hopeless: Vec<SignedTransaction> = candidate
            .dropped
            .into_iter()
            .filter(|(_, err)| {
                !matches!(err, TxError::InvalidNonce { expected, actual } if actual > expected)
            })
            .map(|(tx, _)| tx)
            .collect();
        inner.mempool.remove(&hopeless);
        inner.mempool.prune(&inner.ledger);

        self.mining.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!(
            "Mined block #{} {} with {} transactions",
            block.number(),
            block.hash(),
            block.transactions.len()
        );
        Ok(block)
    }

    /// Stops any proof-of-work search in progress.
    pub fn cancel_mining(&self) {
        if let Some(token) = self.mining.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!("Cancelling in-progress mining");
            token.cancel();
        }
    }

    /// Mines one block on the current tip. Blocking; run it off the async
    /// runtime.
    pub fn mine(&self) -> Result<MineOutcome, NodeError> {
        let (candidate, cancel) = self.prepare_candidate()?;
        match search(candidate.header.clone(), &cancel) {
            SearchOutcome::Found(header) => match self.commit_candidate(candidate, header) {
                Ok(block) => Ok(MineOutcome::Mined(block)),
                Err(NodeError::StaleCandidate) => Ok(MineOutcome::Stale),
                Err(err) => Err(err),
            },
            SearchOutcome::Cancelled => Ok(MineOutcome::Cancelled),
            SearchOutcome::Exhausted => Ok(MineOutcome::Exhausted),
        }
    }

    // ==================== Blocks from peers ====================

    /// Offers one block, typically a peer's freshly mined proposal.
    pub fn accept_block(&self, block: Block) -> Result<BlockAcceptance, NodeError> {
        let mut inner = self.write();
        let height = inner.chain.height();
        let number = block.number();

        if number <= height {
            return Ok(if inner.chain.hash_at(number) == Some(block.hash()) {
                BlockAcceptance::Known
            } else {
                BlockAcceptance::Detached
            });
        }
        if number != height + 1 || block.header.previous_hash != inner.chain.tip_hash() {
            return Ok(BlockAcceptance::Detached);
        }

        let mut ledger = inner.ledger.clone();
        self.validator
            .validate_next(&block, inner.chain.tip_header(), &mut ledger, now_millis())
            .map_err(|source| NodeError::InvalidBlock { number, source })?;

        self.cancel_mining();
        let block = Arc::new(block);
        inner.store.append(&block)?;
        inner
            .chain
            .push(Arc::clone(&block))
            .map_err(|source| NodeError::InvalidBlock { number, source })?;
        inner.ledger = ledger;

        let inner = &mut *inner;
        inner.mempool.remove(&block.transactions);
        inner.mempool.prune(&inner.ledger);

        info!("Accepted block #{} {} from peer", number, block.hash());
        Ok(BlockAcceptance::Committed)
    }

    /// Adopts `blocks` as the chain after local block `ancestor`.
    ///
    /// The resulting chain must be strictly longer than the local one and
    /// fully valid. A pure extension (ancestor is the tip) is validated
    /// against the current ledger; a fork is validated by replaying the
    /// shared prefix and the segment from genesis. Adoption is all or
    /// nothing. Transactions from discarded local blocks go back to the
    /// mempool when they are still valid.
    ///
    /// Blocking; a fork replays the whole chain. Run it off the async runtime.
    pub fn apply_segment(
        &self,
        ancestor: u64,
        blocks: Vec<Block>,
    ) -> Result<SegmentOutcome, NodeError> {
        let mut inner = self.write();
        let height = inner.chain.height();
        let new_height = ancestor + blocks.len() as u64;

        if ancestor > height {
            return Err(NodeError::ChainConflict(format!(
                "segment starts after block #{ancestor}, local tip is #{height}"
            )));
        }
        if new_height <= height {
            if ancestor == height {
                return Ok(SegmentOutcome {
                    ancestor,
                    new_height: height,
                    orphaned: 0,
                });
            }
            return Err(NodeError::ChainConflict(format!(
                "fork after block #{ancestor} reaches #{new_height}, local chain reaches #{height}"
            )));
        }

        let segment: Vec<Arc<Block>> = blocks.into_iter().map(Arc::new).collect();
        let (chain, ledger) = if ancestor == height {
            let mut chain = inner.chain.clone();
            let mut ledger = inner.ledger.clone();
            let now = now_millis();
            for block in &segment {
                self.validator
                    .validate_next(block, chain.tip_header(), &mut ledger, now)
                    .and_then(|_| chain.push(Arc::clone(block)))
                    .map_err(|source| NodeError::InvalidBlock {
                        number: block.number(),
                        source,
                    })?;
            }
            (chain, ledger)
        } else {
            let prefix = inner.chain.range(1, ancestor);
            Chain::replay(&self.genesis, prefix.iter().chain(segment.iter()))?
        };

        self.cancel_mining();
        inner.store.replace_from(ancestor, &segment)?;

        let orphaned = inner.chain.truncate(ancestor);
        inner.chain = chain;
        inner.ledger = ledger;

        let inner = &mut *inner;
        let adopted: HashSet<Hash> = segment
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.id()))
            .collect();
        for block in &segment {
            inner.mempool.remove(&block.transactions);
        }
        inner.mempool.prune(&inner.ledger);
        let mut reinjected = 0;
        for tx in orphaned.iter().flat_map(|b| b.transactions.iter()) {
            if !adopted.contains(&tx.id()) && inner.mempool.add(tx.clone(), &inner.ledger).is_ok() {
                reinjected += 1;
            }
        }

        if orphaned.is_empty() {
            info!("Synced blocks #{}..#{}", ancestor + 1, new_height);
        } else {
            info!(
                "Reorganized after block #{ancestor}: dropped {} local blocks, \
                 now at #{new_height}, {reinjected} transactions returned to the mempool",
                orphaned.len()
            );
        }
        Ok(SegmentOutcome {
            ancestor,
            new_height,
            orphaned: orphaned.len(),
        })
    }
}
