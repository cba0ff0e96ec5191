//! Asset transfer primitive
//!
//! Token movement is external to the vault engine. It is consumed through
//! [`AssetTransfer`], an all-or-nothing `transfer(from, to, amount)`.
//! [`InMemoryAssetLedger`] is the in-process implementation used by tests and
//! paper deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::vault::math::Amount;
use crate::vault::types::Address;

/// Why a transfer was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub reason: String,
}

impl TransferError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer refused: {}", self.reason)
    }
}

impl std::error::Error for TransferError {}

#[async_trait]
pub trait AssetTransfer: Send + Sync {
    /// Move `amount` of `asset` from `from` to `to`. Either the full amount
    /// moves or nothing does.
    async fn transfer(
        &self,
        asset: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError>;

    async fn balance_of(&self, asset: &Address, account: &Address) -> Amount;
}

#[derive(Debug, Default)]
struct LedgerInner {
    balances: HashMap<(Address, Address), Amount>,
    frozen: HashSet<Address>,
}

/// Token balances keyed by `(asset, account)`.
///
/// Accounts can be frozen to make every transfer touching them fail, which is
/// how tests exercise the rollback paths.
#[derive(Debug, Default)]
pub struct InMemoryAssetLedger {
    inner: Mutex<LedgerInner>,
}

impl InMemoryAssetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` out of thin air.
    pub fn mint(&self, asset: &Address, to: &Address, amount: Amount) {
        let mut inner = self.inner.lock();
        *inner
            .balances
            .entry((asset.clone(), to.clone()))
            .or_insert(0) += amount;
    }

    /// Destroy up to `amount`. Returns what was actually removed.
    pub fn burn(&self, asset: &Address, from: &Address, amount: Amount) -> Amount {
        let mut inner = self.inner.lock();
        let key = (asset.clone(), from.clone());
        let balance = inner.balances.get(&key).copied().unwrap_or(0);
        let burned = balance.min(amount);
        inner.balances.insert(key, balance - burned);
        burned
    }

    pub fn freeze(&self, account: &Address) {
        self.inner.lock().frozen.insert(account.clone());
    }

    pub fn unfreeze(&self, account: &Address) {
        self.inner.lock().frozen.remove(account);
    }

    pub fn balance(&self, asset: &Address, account: &Address) -> Amount {
        self.inner
            .lock()
            .balances
            .get(&(asset.clone(), account.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Synchronous transfer, for callers that must settle while holding their
    /// own lock.
    pub fn move_funds(
        &self,
        asset: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock();
        if inner.frozen.contains(from) {
            return Err(TransferError::new(format!("account {} is frozen", from)));
        }
        if inner.frozen.contains(to) {
            return Err(TransferError::new(format!("account {} is frozen", to)));
        }
        if amount == 0 || from == to {
            return Ok(());
        }

        let from_key = (asset.clone(), from.clone());
        let balance = inner.balances.get(&from_key).copied().unwrap_or(0);
        if balance < amount {
            return Err(TransferError::new(format!(
                "{} holds {} of {}, needs {}",
                from, balance, asset, amount
            )));
        }
        inner.balances.insert(from_key, balance - amount);
        *inner
            .balances
            .entry((asset.clone(), to.clone()))
            .or_insert(0) += amount;
        Ok(())
    }

    /// Sum of all balances of `asset`.
    pub fn supply(&self, asset: &Address) -> Amount {
        self.inner
            .lock()
            .balances
            .iter()
            .filter(|((a, _), _)| a == asset)
            .map(|(_, v)| *v)
            .sum()
    }
}

#[async_trait]
impl AssetTransfer for InMemoryAssetLedger {
    async fn transfer(
        &self,
        asset: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError> {
        self.move_funds(asset, from, to, amount)
    }

    async fn balance_of(&self, asset: &Address, account: &Address) -> Amount {
        self.balance(asset, account)
    }
}
