//! Merkle roots over transaction ids.
//!
//! - No leaves: the zero hash.
//! - Odd levels: the last node is paired with itself.
//! - Interior nodes are domain-separated from leaves and other hashes.

use crate::core::transaction::SignedTransaction;
use crate::types::hash::Hash;

const MERKLE_NODE_TAG: &[u8] = b"POWCHAIN_MERKLE_NODE";

pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        let mut h = Hash::sha3();
        h.update(MERKLE_NODE_TAG);
        h.update(left.as_slice());
        h.update(right.as_slice());
        h.finalize()
    }

    /// Reduces `nodes` level by level in place.
    pub fn from_raw(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return Hash::zero();
        }

        let mut len = nodes.len();
        while len > 1 {
            let mut write = 0;
            for read in (0..len).step_by(2) {
                let left = nodes[read];
                let right = if read + 1 < len { nodes[read + 1] } else { left };
                nodes[write] = Self::hash_pair(left, right);
                write += 1;
            }
            len = write;
        }

        nodes[0]
    }

    /// The block `transactionRoot`: Merkle root of the transaction ids in order.
    pub fn from_transactions(txs: &[SignedTransaction]) -> Hash {
        Self::from_raw(txs.iter().map(SignedTransaction::id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::utils::{key, transfer};

    fn leaf(data: &[u8]) -> Hash {
        let mut h = Hash::sha3();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn empty_is_zero_and_single_leaf_is_itself() {
        assert_eq!(MerkleTree::from_raw(Vec::new()), Hash::zero());
        let a = leaf(b"a");
        assert_eq!(MerkleTree::from_raw(vec![a]), a);
    }

    #[test]
    fn odd_level_duplicates_last_node() {
        let (a, b, c) = (leaf(b"a"), leaf(b"b"), leaf(b"c"));
        let expected =
            MerkleTree::hash_pair(MerkleTree::hash_pair(a, b), MerkleTree::hash_pair(c, c));
        assert_eq!(MerkleTree::from_raw(vec![a, b, c]), expected);
    }

    #[test]
    fn transaction_order_changes_the_root() {
        let alice = key(1);
        let bob = key(2);
        let t1 = transfer(&alice, bob.address(), 0, 10, 1);
        let t2 = transfer(&alice, bob.address(), 1, 20, 1);

        let forward = MerkleTree::from_transactions(&[t1.clone(), t2.clone()]);
        assert_eq!(forward, MerkleTree::from_raw(vec![t1.id(), t2.id()]));
        assert_ne!(forward, MerkleTree::from_transactions(&[t2, t1]));
    }
}
