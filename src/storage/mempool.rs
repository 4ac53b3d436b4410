//! Pending transactions awaiting inclusion in a block.
//!
//! Entries are grouped per sender in nonce order. Block assembly walks the
//! senders through a max-heap keyed on each sender's lowest pending nonce, so
//! nonce order is kept within an account while higher tips (then earlier
//! arrival) go first across accounts.
//!
//! The pool is not synchronized on its own; it lives inside the node's
//! single-writer state together with the ledger it is validated against.

use crate::core::ledger::Ledger;
use crate::core::transaction::{SignedTransaction, TxError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use powchain_derive::Error;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

pub const MEMPOOL_CAPACITY: usize = 10_000;

/// How far past the ledger nonce a pending transaction may be.
pub const MAX_NONCE_AHEAD: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[source] TxError),

    #[error("mempool is full ({capacity} entries)")]
    PoolFull { capacity: usize },
}

impl From<TxError> for MempoolError {
    fn from(err: TxError) -> Self {
        MempoolError::InvalidTransaction(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Replaced the pending entry with this id for the same sender and nonce.
    Replaced(Hash),
}

#[derive(Debug, Clone)]
struct Entry {
    tx: SignedTransaction,
    id: Hash,
    arrival: u64,
}

/// A sender's lowest not-yet-picked entry.
#[derive(PartialEq, Eq)]
struct Head {
    tip: u64,
    arrival: u64,
    sender: Address,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tip
            .cmp(&other.tip)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct Mempool {
    chain_id: u16,
    capacity: usize,
    next_arrival: u64,
    accounts: BTreeMap<Address, BTreeMap<u64, Entry>>,
    ids: HashMap<Hash, (Address, u64)>,
}

impl Mempool {
    pub fn new(chain_id: u16, capacity: usize) -> Self {
        Self {
            chain_id,
            capacity: capacity.max(1),
            next_arrival: 0,
            accounts: BTreeMap::new(),
            ids: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.ids.contains_key(id)
    }

    /// Admits `tx` after checking it against the current `ledger`.
    ///
    /// The nonce may not be below the sender's ledger nonce, nor
    /// [`MAX_NONCE_AHEAD`] or more past it. The balance must cover this
    /// transaction plus every pending lower-nonce one from the same sender.
    /// A pending entry with the same sender and nonce is replaced only by a
    /// strictly higher tip.
    pub fn add(
        &mut self,
        tx: SignedTransaction,
        ledger: &Ledger,
    ) -> Result<Admission, MempoolError> {
        tx.validate(self.chain_id)?;

        let sender = tx.sender();
        let nonce = tx.nonce();
        let account = ledger.account(&sender);
        if nonce < account.nonce || nonce >= account.nonce.saturating_add(MAX_NONCE_AHEAD) {
            return Err(TxError::InvalidNonce {
                expected: account.nonce,
                actual: nonce,
            }
            .into());
        }

        let queue = self.accounts.get(&sender);
        let replaced = queue.and_then(|q| q.get(&nonce)).map(|e| (e.id, e.tx.tip()));
        match replaced {
            Some((_, pending)) if tx.tip() <= pending => {
                return Err(TxError::TipTooLow {
                    offered: tx.tip(),
                    pending,
                }
                .into());
            }
            None if self.len() >= self.capacity => {
                return Err(MempoolError::PoolFull {
                    capacity: self.capacity,
                });
            }
            _ => {}
        }

        let mut required = tx.tx.cost()?;
        if let Some(queue) = queue {
            for entry in queue.range(..nonce).map(|(_, e)| e) {
                required = entry
                    .tx
                    .tx
                    .cost()
                    .and_then(|c| required.checked_add(c).ok_or(TxError::Overflow))?;
            }
        }
        if account.balance < required {
            return Err(TxError::InsufficientFunds {
                balance: account.balance,
                required,
            }
            .into());
        }

        let id = tx.id();
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        if let Some((old_id, _)) = replaced {
            self.ids.remove(&old_id);
        }
        self.ids.insert(id, (sender, nonce));
        self.accounts
            .entry(sender)
            .or_default()
            .insert(nonce, Entry { tx, id, arrival });

        Ok(match replaced {
            Some((old_id, _)) => Admission::Replaced(old_id),
            None => Admission::Added,
        })
    }

    /// Up to `max` transactions in block-assembly order. Does not remove them.
    pub fn pick(&self, max: usize) -> Vec<SignedTransaction> {
        let mut cursors: HashMap<Address, _> = self
            .accounts
            .iter()
            .map(|(sender, queue)| (*sender, queue.values().peekable()))
            .collect();

        let mut heap: BinaryHeap<Head> = cursors
            .iter_mut()
            .filter_map(|(sender, cursor)| {
                cursor.peek().map(|e| Head {
                    tip: e.tx.tip(),
                    arrival: e.arrival,
                    sender: *sender,
                })
            })
            .collect();

        let mut picked = Vec::with_capacity(max.min(self.len()));
        while picked.len() < max {
            let Some(head) = heap.pop() else { break };
            let Some(cursor) = cursors.get_mut(&head.sender) else {
                continue;
            };
            if let Some(entry) = cursor.next() {
                picked.push(entry.tx.clone());
            }
            if let Some(next) = cursor.peek() {
                heap.push(Head {
                    tip: next.tx.tip(),
                    arrival: next.arrival,
                    sender: head.sender,
                });
            }
        }
        picked
    }

    /// Every pending transaction, in block-assembly order.
    pub fn transactions(&self) -> Vec<SignedTransaction> {
        self.pick(self.len())
    }

    /// Removes the given transactions by id; unknown ones are ignored.
    pub fn remove(&mut self, txs: &[SignedTransaction]) {
        for tx in txs {
            let id = tx.id();
            let Some((sender, nonce)) = self.ids.remove(&id) else {
                continue;
            };
            if let Some(queue) = self.accounts.get_mut(&sender) {
                queue.remove(&nonce);
                if queue.is_empty() {
                    self.accounts.remove(&sender);
                }
            }
        }
    }

    /// Drops entries whose nonce the ledger has already consumed.
    pub fn prune(&mut self, ledger: &Ledger) -> usize {
        let mut removed = 0;
        self.accounts.retain(|sender, queue| {
            let keep = queue.split_off(&ledger.nonce(sender));
            for entry in queue.values() {
                self.ids.remove(&entry.id);
                removed += 1;
            }
            *queue = keep;
            !queue.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::utils::{TEST_CHAIN_ID, key, transfer};

    fn ledger(entries: &[(Address, u64)]) -> Ledger {
        let mut ledger = Ledger::new();
        for (address, amount) in entries {
            ledger.credit(*address, *amount).unwrap();
        }
        ledger
    }

    fn pool() -> Mempool {
        Mempool::new(TEST_CHAIN_ID, MEMPOOL_CAPACITY)
    }

    #[test]
    fn same_sender_and_nonce_is_held_once() {
        let alice = key(1);
        let state = ledger(&[(alice.address(), 1000)]);
        let mut pool = pool();

        let low = transfer(&alice, key(2).address(), 0, 100, 5);
        let same = transfer(&alice, key(3).address(), 0, 100, 5);
        let high = transfer(&alice, key(3).address(), 0, 100, 6);

        assert_eq!(pool.add(low.clone(), &state), Ok(Admission::Added));
        assert_eq!(
            pool.add(same, &state),
            Err(MempoolError::InvalidTransaction(TxError::TipTooLow { offered: 5, pending: 5 }))
        );
        assert_eq!(pool.add(high.clone(), &state), Ok(Admission::Replaced(low.id())));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.transactions(), vec![high]);
        assert!(!pool.contains(&low.id()));
    }

    #[test]
    fn identical_resubmission_is_rejected() {
        let alice = key(1);
        let state = ledger(&[(alice.address(), 1000)]);
        let mut pool = pool();
        let tx = transfer(&alice, key(2).address(), 0, 100, 5);

        pool.add(tx.clone(), &state).unwrap();
        assert!(pool.add(tx, &state).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn nonce_window_is_enforced() {
        let alice = key(1);
        let mut state = ledger(&[(alice.address(), 1000)]);
        state
            .apply(&transfer(&alice, key(2).address(), 0, 1, 0), &key(9).address())
            .unwrap();
        let mut pool = pool();

        assert_eq!(
            pool.add(transfer(&alice, key(2).address(), 0, 1, 0), &state),
            Err(MempoolError::InvalidTransaction(TxError::InvalidNonce { expected: 1, actual: 0 }))
        );
        let too_far = transfer(&alice, key(2).address(), 1 + MAX_NONCE_AHEAD, 1, 0);
        assert!(pool.add(too_far, &state).is_err());
        let at_edge = transfer(&alice, key(2).address(), MAX_NONCE_AHEAD, 1, 0);
        assert!(pool.add(at_edge, &state).is_ok());
    }

    #[test]
    fn funds_cover_pending_lower_nonces() {
        let alice = key(1);
        let state = ledger(&[(alice.address(), 100)]);
        let mut pool = pool();

        pool.add(transfer(&alice, key(2).address(), 0, 60, 0), &state).unwrap();
        assert_eq!(
            pool.add(transfer(&alice, key(2).address(), 1, 40, 1), &state),
            Err(MempoolError::InvalidTransaction(TxError::InsufficientFunds {
                balance: 100,
                required: 101
            }))
        );
        pool.add(transfer(&alice, key(2).address(), 1, 40, 0), &state).unwrap();
    }

    #[test]
    fn bad_signature_is_wrapped() {
        let alice = key(1);
        let state = ledger(&[(alice.address(), 100)]);
        let mut tx = transfer(&alice, key(2).address(), 0, 10, 0);
        tx.tx.value = 11;
        assert_eq!(
            pool().add(tx, &state),
            Err(MempoolError::InvalidTransaction(TxError::InvalidSignature))
        );
    }

    #[test]
    fn capacity_is_enforced_for_new_entries_only() {
        let alice = key(1);
        let bob = key(2);
        let state = ledger(&[(alice.address(), 100), (bob.address(), 100)]);
        let mut pool = Mempool::new(TEST_CHAIN_ID, 1);

        pool.add(transfer(&alice, key(3).address(), 0, 1, 0), &state).unwrap();
        assert_eq!(
            pool.add(transfer(&bob, key(3).address(), 0, 1, 0), &state),
            Err(MempoolError::PoolFull { capacity: 1 })
        );
        assert!(pool.add(transfer(&alice, key(3).address(), 0, 1, 1), &state).is_ok());
    }

    #[test]
    fn pick_orders_by_nonce_then_tip_then_arrival() {
        let alice = key(1);
        let bob = key(2);
        let carol = key(3);
        let sink = key(4).address();
        let state = ledger(&[
            (alice.address(), 1000),
            (bob.address(), 1000),
            (carol.address(), 1000),
        ]);
        let mut pool = pool();

        let a0 = transfer(&alice, sink, 0, 1, 1);
        let a1 = transfer(&alice, sink, 1, 1, 50);
        let b0 = transfer(&bob, sink, 0, 1, 10);
        let c0 = transfer(&carol, sink, 0, 1, 10);

        // a1 arrives first but cannot jump ahead of a0.
        pool.add(a1.clone(), &state).unwrap();
        pool.add(b0.clone(), &state).unwrap();
        pool.add(c0.clone(), &state).unwrap();
        pool.add(a0.clone(), &state).unwrap();

        assert_eq!(pool.pick(10), vec![b0.clone(), c0.clone(), a0, a1]);
        assert_eq!(pool.pick(2), vec![b0, c0]);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn remove_and_prune() {
        let alice = key(1);
        let mut state = ledger(&[(alice.address(), 1000)]);
        let mut pool = pool();
        let txs: Vec<_> = (0..3)
            .map(|n| transfer(&alice, key(2).address(), n, 10, 0))
            .collect();
        for tx in &txs {
            pool.add(tx.clone(), &state).unwrap();
        }

        pool.remove(&txs[2..]);
        assert_eq!(pool.len(), 2);

        state.apply(&txs[0], &key(9).address()).unwrap();
        assert_eq!(pool.prune(&state), 1);
        assert_eq!(pool.transactions(), vec![txs[1].clone()]);
    }
}
