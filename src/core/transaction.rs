//! Value transfers and the transaction signature codec.
//!
//! Signing never touches a free-form serialization. The unsigned transaction
//! is encoded with the deterministic binary codec, prefixed with a versioned
//! domain tag and the encoded length, and hashed:
//!
//! ```text
//! signing_hash = SHA3-256("\x19POWCHAIN_TX_V1" || u64_le(len(enc)) || enc)
//! ```
//!
//! The signature over that hash is recoverable, so the sender's address is
//! derived from `{v, r, s}` and compared against `from`.

use crate::crypto::key_pair::{CryptoError, PrivateKey, RecoverableSignature};
use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use powchain_derive::{BinaryCodec, Error};

/// Domain tag mixed into every transaction signing hash.
pub const SIGNING_DOMAIN_TAG: &[u8] = b"\x19POWCHAIN_TX_V1";

const TX_ID_TAG: &[u8] = b"POWCHAIN_TXID";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid nonce: expected {expected}, got {actual}")]
    InvalidNonce { expected: u64, actual: u64 },
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },
    #[error("wrong chain id: expected {expected}, got {actual}")]
    WrongChain { expected: u16, actual: u16 },
    #[error("sender and recipient are the same account")]
    SelfTransfer,
    #[error("transfer value must be greater than zero")]
    ZeroValue,
    #[error("amount overflows u64")]
    Overflow,
    #[error("replacement tip {offered} does not exceed pending tip {pending}")]
    TipTooLow { offered: u64, pending: u64 },
}

/// Unsigned transfer instruction.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Transaction {
    pub chain_id: u16,
    pub from: Address,
    pub to: Address,
    /// Must equal the sender's ledger nonce when applied.
    pub nonce: u64,
    pub value: u64,
    /// Paid to the block beneficiary.
    pub tip: u64,
    /// Opaque payload; never interpreted.
    pub data: Bytes,
    /// Milliseconds since the unix epoch, as chosen by the sender.
    pub timestamp: u64,
}

impl Transaction {
    /// Hash that the sender signs.
    pub fn signing_hash(&self) -> Hash {
        let encoded = self.encode_to_vec();
        let mut h = Hash::sha3();
        h.update(SIGNING_DOMAIN_TAG);
        (encoded.len() as u64).encode(&mut h);
        h.update(&encoded);
        h.finalize()
    }

    pub fn sign(self, key: &PrivateKey) -> Result<SignedTransaction, CryptoError> {
        let signature = key.sign_prehash(&self.signing_hash())?;
        Ok(SignedTransaction {
            tx: self,
            signature,
        })
    }

    /// Total debit from the sender: `value + tip`.
    pub fn cost(&self) -> Result<u64, TxError> {
        self.value.checked_add(self.tip).ok_or(TxError::Overflow)
    }

    /// Stateless field checks: chain id, distinct accounts, non-zero value.
    pub fn check_fields(&self, chain_id: u16) -> Result<(), TxError> {
        if self.chain_id != chain_id {
            return Err(TxError::WrongChain {
                expected: chain_id,
                actual: self.chain_id,
            });
        }
        if self.from == self.to {
            return Err(TxError::SelfTransfer);
        }
        if self.value == 0 {
            return Err(TxError::ZeroValue);
        }
        self.cost().map(|_| ())
    }
}

/// Transaction plus the sender's recoverable signature. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub signature: RecoverableSignature,
}

impl SignedTransaction {
    /// Unique identifier over the full signed encoding.
    pub fn id(&self) -> Hash {
        Hash::tagged(TX_ID_TAG, self)
    }

    pub fn sender(&self) -> Address {
        self.tx.from
    }

    pub fn nonce(&self) -> u64 {
        self.tx.nonce
    }

    pub fn tip(&self) -> u64 {
        self.tx.tip
    }

    /// Recovers the signer from `{v, r, s}` over the signing hash and checks
    /// that it is `from`.
    pub fn recover_sender(&self) -> Result<Address, TxError> {
        let signer = self
            .signature
            .recover(&self.tx.signing_hash())
            .map_err(|_| TxError::InvalidSignature)?;
        if signer.address() != self.tx.from {
            return Err(TxError::InvalidSignature);
        }
        Ok(signer.address())
    }

    /// Everything that can be checked without a ledger.
    pub fn validate(&self, chain_id: u16) -> Result<(), TxError> {
        self.tx.check_fields(chain_id)?;
        self.recover_sender().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Decode;
    use crate::utils::test_utils::utils::{TEST_CHAIN_ID, key, transfer, unsigned_transfer};

    #[test]
    fn recovered_sender_is_from() {
        for seed in 1..=5u8 {
            let sender = key(seed);
            let tx = transfer(&sender, key(seed + 10).address(), 0, 25, 1);
            assert_eq!(tx.recover_sender(), Ok(sender.address()));
            assert_eq!(tx.validate(TEST_CHAIN_ID), Ok(()));
        }
    }

    #[test]
    fn any_flipped_signature_byte_fails() {
        let tx = transfer(&key(1), key(2).address(), 0, 25, 1);
        let raw = tx.signature.encode_to_vec();
        assert_eq!(raw.len(), 65);

        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let mut forged = tx.clone();
            forged.signature = RecoverableSignature::from_bytes(&tampered).unwrap();
            assert_eq!(forged.recover_sender(), Err(TxError::InvalidSignature), "byte {i}");
        }
    }

    #[test]
    fn altered_field_invalidates_signature() {
        let mut tx = transfer(&key(1), key(2).address(), 0, 25, 1);
        tx.tx.value = 26;
        assert_eq!(tx.recover_sender(), Err(TxError::InvalidSignature));
    }

    #[test]
    fn claiming_another_sender_fails() {
        let mut tx = transfer(&key(1), key(2).address(), 0, 25, 1);
        tx.tx.from = key(3).address();
        assert_eq!(tx.recover_sender(), Err(TxError::InvalidSignature));
    }

    #[test]
    fn signing_hash_is_domain_separated_and_length_prefixed() {
        let tx = unsigned_transfer(key(1).address(), key(2).address(), 0, 25, 1);
        let enc = tx.encode_to_vec();

        let mut expected = Hash::sha3();
        expected.update(b"\x19POWCHAIN_TX_V1");
        expected.update(&(enc.len() as u64).to_le_bytes());
        expected.update(&enc);
        assert_eq!(tx.signing_hash(), expected.finalize());

        let mut bare = Hash::sha3();
        bare.update(&enc);
        assert_ne!(tx.signing_hash(), bare.finalize());
    }

    #[test]
    fn field_checks() {
        let a = key(1).address();
        let b = key(2).address();

        assert_eq!(
            unsigned_transfer(a, a, 0, 1, 0).check_fields(TEST_CHAIN_ID),
            Err(TxError::SelfTransfer)
        );
        assert_eq!(
            unsigned_transfer(a, b, 0, 0, 5).check_fields(TEST_CHAIN_ID),
            Err(TxError::ZeroValue)
        );
        assert_eq!(
            unsigned_transfer(a, b, 0, 1, 0).check_fields(TEST_CHAIN_ID + 1),
            Err(TxError::WrongChain {
                expected: TEST_CHAIN_ID + 1,
                actual: TEST_CHAIN_ID
            })
        );
        assert_eq!(
            unsigned_transfer(a, b, 0, u64::MAX, 1).check_fields(TEST_CHAIN_ID),
            Err(TxError::Overflow)
        );
    }

    #[test]
    fn id_covers_signature() {
        let sender = key(1);
        let unsigned = unsigned_transfer(sender.address(), key(2).address(), 0, 25, 1);
        let signed = unsigned.clone().sign(&sender).unwrap();
        let mut other = signed.clone();
        other.signature.s[31] ^= 1;

        assert_ne!(signed.id(), other.id());
        assert_eq!(SignedTransaction::from_bytes(&signed.encode_to_vec()).unwrap(), signed);
    }
}
