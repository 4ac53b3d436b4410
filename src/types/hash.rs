//! 32-byte SHA3-256 hash and incremental builder.

use crate::types::encoding::{Encode, EncodeSink};
use powchain_derive::BinaryCodec;
use sha3::{Digest, Sha3_256};
use std::fmt;

pub const HASH_LEN: usize = 32;

/// SHA3-256 digest used for block hashes, transaction ids, Merkle nodes and
/// ledger snapshots.
#[derive(Clone, Copy, PartialEq, Eq, BinaryCodec, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Hashes a domain tag followed by the encoding of `value`.
    pub fn tagged<T: Encode + ?Sized>(tag: &[u8], value: &T) -> Hash {
        let mut h = Hash::sha3();
        h.update(tag);
        value.encode(&mut h);
        h.finalize()
    }

    /// Number of leading zero bits, reading the digest as a big-endian integer.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    /// Proof-of-work predicate: at least `difficulty` leading zero bits.
    pub fn meets_difficulty(&self, difficulty: u8) -> bool {
        self.leading_zero_bits() >= u32::from(difficulty)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// Streaming SHA3-256. Implements [`EncodeSink`] so values can be encoded
/// straight into the digest.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_prefix(prefix: &[u8]) -> Hash {
        let mut raw = [0xFFu8; HASH_LEN];
        raw[..prefix.len()].copy_from_slice(prefix);
        Hash(raw)
    }

    #[test]
    fn sha3_of_empty_input_matches_known_digest() {
        assert_eq!(
            Hash::sha3().finalize().to_string(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        assert_eq!(with_prefix(&[]).leading_zero_bits(), 0);
        assert_eq!(with_prefix(&[0x00, 0x80]).leading_zero_bits(), 8);
        assert_eq!(with_prefix(&[0x00, 0x00, 0x0F]).leading_zero_bits(), 20);
        assert_eq!(Hash::zero().leading_zero_bits(), 256);
    }

    #[test]
    fn meets_difficulty_is_inclusive() {
        let h = with_prefix(&[0x00, 0x1F]);
        assert!(h.meets_difficulty(0));
        assert!(h.meets_difficulty(11));
        assert!(!h.meets_difficulty(12));
    }

    #[test]
    fn tagged_hash_separates_domains() {
        assert_ne!(Hash::tagged(b"A", &1u64), Hash::tagged(b"B", &1u64));
        assert_eq!(Hash::tagged(b"A", &1u64), Hash::tagged(b"A", &1u64));
    }
}
