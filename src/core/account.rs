use crate::types::address::Address;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use powchain_derive::BinaryCodec;

/// Balance and nonce of one account, as held by the ledger.
///
/// Accounts that were never touched read as the default (zero balance,
/// nonce 0), so lookups never fail.
#[derive(BinaryCodec, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Spendable balance.
    pub balance: u64,
    /// Number of transactions applied from this account; the next valid nonce.
    pub nonce: u64,
}

impl Account {
    pub fn new(balance: u64) -> Self {
        Self { balance, nonce: 0 }
    }

    /// True for accounts indistinguishable from one that was never touched.
    pub fn is_empty(&self) -> bool {
        self.balance == 0 && self.nonce == 0
    }

    /// Hash of one `(address, account)` record in the state snapshot.
    pub fn record_hash(&self, address: &Address) -> Hash {
        let mut h = Hash::sha3();
        h.update(b"POWCHAIN_ACCOUNT");
        address.encode(&mut h);
        self.encode(&mut h);
        h.finalize()
    }
}

/// Public view of an account, returned by account queries.
#[derive(BinaryCodec, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_account_is_empty() {
        assert!(Account::default().is_empty());
        assert!(!Account::new(1).is_empty());
        assert!(!Account { balance: 0, nonce: 1 }.is_empty());
    }

    #[test]
    fn record_hash_binds_address() {
        let account = Account::new(5);
        assert_ne!(
            account.record_hash(&Address([1; 20])),
            account.record_hash(&Address([2; 20]))
        );
    }
}
