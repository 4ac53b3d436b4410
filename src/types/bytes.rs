//! Shared immutable byte buffer.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink, decode_len, take};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Reference-counted bytes; cloning never copies the payload.
///
/// Used for the opaque `data` field of transactions, which travels through
/// the mempool, blocks and peer messages without being modified.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(Arc<Vec<u8>>);

impl Bytes {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(data.into()))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(data))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes(0x{})", hex::encode(self.as_slice()))
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data)
    }
}

impl From<&str> for Bytes {
    fn from(data: &str) -> Self {
        Self::new(data)
    }
}

impl Encode for Bytes {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self.as_slice());
    }
}

impl Decode for Bytes {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(input)?;
        Ok(Self::new(take(input, len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage() {
        let a = Bytes::from("memo");
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn encodes_like_a_byte_vec() {
        let data = Bytes::from(vec![1u8, 2, 3]);
        assert_eq!(data.encode_to_vec(), vec![1u8, 2, 3].encode_to_vec());
        assert_eq!(Bytes::from_bytes(&data.encode_to_vec()).unwrap(), data);
    }

    #[test]
    fn debug_is_hex() {
        assert_eq!(format!("{:?}", Bytes::from(&[0xAB, 0x01][..])), "Bytes(0xab01)");
    }
}
