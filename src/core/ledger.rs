//! Account ledger: balances and nonces keyed by address.

use crate::core::account::{Account, AccountInfo};
use crate::core::transaction::{SignedTransaction, TxError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use std::collections::BTreeMap;

const STATE_SNAPSHOT_TAG: &[u8] = b"POWCHAIN_STATE";

/// Materialized result of replaying the chain.
///
/// Kept in a `BTreeMap` so iteration (and therefore [`Ledger::snapshot`]) is
/// in address order on every node. Cloning gives the scratch copies used for
/// block assembly and validation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    accounts: BTreeMap<Address, Account>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing accounts read as zero balance, nonce 0.
    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.account(address).balance
    }

    pub fn nonce(&self, address: &Address) -> u64 {
        self.account(address).nonce
    }

    /// Applies a transfer whose beneficiary collects the tip.
    ///
    /// Checks, in order, the exact nonce and then the sender's funds for
    /// `value + tip`. Every credit and debit is computed before anything is
    /// written, so an error leaves the ledger untouched.
    pub fn apply(
        &mut self,
        stx: &SignedTransaction,
        beneficiary: &Address,
    ) -> Result<(), TxError> {
        let tx = &stx.tx;
        let mut staged: BTreeMap<Address, Account> = BTreeMap::new();

        let mut sender = self.account(&tx.from);
        if tx.nonce != sender.nonce {
            return Err(TxError::InvalidNonce {
                expected: sender.nonce,
                actual: tx.nonce,
            });
        }
        let cost = tx.cost()?;
        if sender.balance < cost {
            return Err(TxError::InsufficientFunds {
                balance: sender.balance,
                required: cost,
            });
        }
        sender.balance -= cost;
        sender.nonce = sender.nonce.checked_add(1).ok_or(TxError::Overflow)?;
        staged.insert(tx.from, sender);

        self.stage_credit(&mut staged, tx.to, tx.value)?;
        self.stage_credit(&mut staged, *beneficiary, tx.tip)?;

        self.accounts.extend(staged);
        Ok(())
    }

    /// Credits `amount` outside of any transfer: genesis funding and
    /// mining rewards.
    pub fn credit(&mut self, address: Address, amount: u64) -> Result<(), TxError> {
        let mut staged = BTreeMap::new();
        self.stage_credit(&mut staged, address, amount)?;
        self.accounts.extend(staged);
        Ok(())
    }

    fn stage_credit(
        &self,
        staged: &mut BTreeMap<Address, Account>,
        address: Address,
        amount: u64,
    ) -> Result<(), TxError> {
        if amount == 0 {
            return Ok(());
        }
        let mut account = staged
            .get(&address)
            .copied()
            .unwrap_or_else(|| self.account(&address));
        account.balance = account.balance.checked_add(amount).ok_or(TxError::Overflow)?;
        staged.insert(address, account);
        Ok(())
    }

    /// State root: hash over every non-empty account record in address order.
    ///
    /// Empty records are skipped so that an account touched with a zero
    /// amount hashes the same as one never touched.
    pub fn snapshot(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(STATE_SNAPSHOT_TAG);
        for (address, account) in self.accounts.iter().filter(|(_, a)| !a.is_empty()) {
            h.update(account.record_hash(address).as_slice());
        }
        h.finalize()
    }

    /// Non-empty accounts in address order.
    pub fn accounts(&self) -> Vec<AccountInfo> {
        self.accounts
            .iter()
            .filter(|(_, a)| !a.is_empty())
            .map(|(address, account)| AccountInfo {
                address: *address,
                balance: account.balance,
                nonce: account.nonce,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::utils::{key, transfer};

    fn funded(entries: &[(Address, u64)]) -> Ledger {
        let mut ledger = Ledger::new();
        for (address, amount) in entries {
            ledger.credit(*address, *amount).unwrap();
        }
        ledger
    }

    #[test]
    fn apply_moves_value_and_tip() {
        let alice = key(1);
        let bob = key(2).address();
        let miner = key(3).address();
        let mut ledger = funded(&[(alice.address(), 1000)]);

        ledger.apply(&transfer(&alice, bob, 0, 250, 10), &miner).unwrap();

        assert_eq!(ledger.account(&alice.address()), Account { balance: 740, nonce: 1 });
        assert_eq!(ledger.account(&bob), Account { balance: 250, nonce: 0 });
        assert_eq!(ledger.balance(&miner), 10);
    }

    #[test]
    fn applying_twice_fails_with_invalid_nonce() {
        let alice = key(1);
        let miner = key(3).address();
        let mut ledger = funded(&[(alice.address(), 1000)]);
        let tx = transfer(&alice, key(2).address(), 0, 100, 0);

        ledger.apply(&tx, &miner).unwrap();
        let before = ledger.clone();
        assert_eq!(
            ledger.apply(&tx, &miner),
            Err(TxError::InvalidNonce { expected: 1, actual: 0 })
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn nonce_gap_is_rejected() {
        let alice = key(1);
        let mut ledger = funded(&[(alice.address(), 1000)]);
        assert_eq!(
            ledger.apply(&transfer(&alice, key(2).address(), 1, 1, 0), &key(3).address()),
            Err(TxError::InvalidNonce { expected: 0, actual: 1 })
        );
    }

    #[test]
    fn insufficient_funds_leaves_state_untouched() {
        let alice = key(1);
        let mut ledger = funded(&[(alice.address(), 100)]);
        let before = ledger.clone();

        assert_eq!(
            ledger.apply(&transfer(&alice, key(2).address(), 0, 95, 10), &key(3).address()),
            Err(TxError::InsufficientFunds { balance: 100, required: 105 })
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn unknown_sender_is_implicitly_empty() {
        let ghost = key(9);
        let mut ledger = Ledger::new();
        assert_eq!(
            ledger.apply(&transfer(&ghost, key(2).address(), 0, 1, 0), &key(3).address()),
            Err(TxError::InsufficientFunds { balance: 0, required: 1 })
        );
    }

    #[test]
    fn credit_overflow_is_all_or_nothing() {
        let alice = key(1);
        let bob = key(2).address();
        let mut ledger = funded(&[(alice.address(), 10), (bob, u64::MAX)]);
        let before = ledger.clone();

        assert_eq!(
            ledger.apply(&transfer(&alice, bob, 0, 5, 0), &key(3).address()),
            Err(TxError::Overflow)
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn sender_can_be_beneficiary() {
        let miner = key(1);
        let mut ledger = funded(&[(miner.address(), 100)]);
        ledger
            .apply(&transfer(&miner, key(2).address(), 0, 40, 5), &miner.address())
            .unwrap();
        assert_eq!(ledger.balance(&miner.address()), 60);
    }

    #[test]
    fn snapshot_is_independent_of_application_order() {
        let alice = key(1);
        let carol = key(4);
        let bob = key(2).address();
        let miner = key(3).address();
        let genesis = funded(&[(alice.address(), 500), (carol.address(), 500)]);

        let a = transfer(&alice, bob, 0, 100, 3);
        let b = transfer(&carol, bob, 0, 50, 7);

        let mut forward = genesis.clone();
        forward.apply(&a, &miner).unwrap();
        forward.apply(&b, &miner).unwrap();

        let mut backward = genesis.clone();
        backward.apply(&b, &miner).unwrap();
        backward.apply(&a, &miner).unwrap();

        assert_eq!(forward.snapshot(), backward.snapshot());
        assert_ne!(forward.snapshot(), genesis.snapshot());
    }

    #[test]
    fn snapshot_ignores_empty_records() {
        let mut touched = funded(&[(key(1).address(), 10)]);
        touched.accounts.insert(key(2).address(), Account::default());
        assert_eq!(touched.snapshot(), funded(&[(key(1).address(), 10)]).snapshot());
        assert_eq!(touched.accounts().len(), 1);
    }
}
