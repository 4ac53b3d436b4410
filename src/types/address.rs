//! 20-byte account identities.

use crate::types::hash::Hash;
use powchain_derive::{BinaryCodec, Error};
use std::fmt;
use std::str::FromStr;

pub const ADDRESS_SIZE: usize = 20;

/// Account identity: the last 20 bytes of SHA3-256 over the uncompressed
/// secp256k1 public key (without the `0x04` tag). Rendered as `0x` + hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("address must be 20 hex-encoded bytes: {0}")]
    InvalidHex(String),
}

impl Address {
    pub const fn zero() -> Self {
        Address([0u8; ADDRESS_SIZE])
    }

    /// Derives the address from a 64-byte `x || y` public key encoding.
    pub fn from_public_key_bytes(xy: &[u8]) -> Self {
        let mut h = Hash::sha3();
        h.update(xy);
        let digest = h.finalize();
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&digest.0[digest.0.len() - ADDRESS_SIZE..]);
        Address(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| AddressError::MissingPrefix(s.to_string()))?;
        let mut addr = [0u8; ADDRESS_SIZE];
        hex::decode_to_slice(digits, &mut addr)
            .map_err(|_| AddressError::InvalidHex(s.to_string()))?;
        Ok(Address(addr))
    }
}
