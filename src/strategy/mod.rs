//! Strategy adapters
//!
//! A strategy wraps one yield source. Vaults only ever talk to it through the
//! [`Strategy`] capability set:
//! - report current holdings (`total_managed_value`, `max_withdraw`,
//!   `preview_withdraw`)
//! - accept deposited funds (`deposit`)
//! - return withdrawn funds (`withdraw`)
//! - report harvestable profit or loss (`report`)
//!
//! Every call is scoped to one vault's position, so vaults sharing an adapter
//! never see each other's gains or losses.
//!
//! Adapters are resolved by address through the shared [`StrategyRegistry`],
//! which is also how ledgers restored from disk are re-attached to live
//! adapters after a restart.

pub mod mock;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

use crate::vault::math::Amount;
use crate::vault::types::Address;

pub use mock::MockStrategy;

/// Profit or loss on one vault's position since its debt was last booked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub gain: Amount,
    pub loss: Amount,
}

impl StrategyReport {
    /// Compare what a vault's position is worth with the debt it carries.
    pub fn from_value(managed: Amount, current_debt: Amount) -> Self {
        Self {
            gain: managed.saturating_sub(current_debt),
            loss: current_debt.saturating_sub(managed),
        }
    }
}

/// One adapter may serve several vaults, so every query and every flow names
/// the vault whose position it concerns.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn address(&self) -> &Address;

    /// Asset the strategy accounts in; must match the vault's.
    fn asset(&self) -> &Address;

    /// What `vault`'s position is currently worth.
    async fn total_managed_value(&self, vault: &Address) -> anyhow::Result<Amount>;

    /// How much of `vault`'s position could be returned right now.
    async fn max_withdraw(&self, vault: &Address) -> anyhow::Result<Amount> {
        self.total_managed_value(vault).await
    }

    /// What `withdraw(vault, amount)` would deliver right now. Moves nothing.
    async fn preview_withdraw(&self, vault: &Address, amount: Amount) -> anyhow::Result<Amount> {
        Ok(amount.min(self.max_withdraw(vault).await?))
    }

    /// Pull up to `amount` from `vault` into the strategy. Returns the amount
    /// accepted (moved).
    async fn deposit(&self, vault: &Address, amount: Amount) -> anyhow::Result<Amount>;

    /// Send up to `amount` of `vault`'s position back to `vault`. Returns the
    /// amount actually delivered.
    async fn withdraw(&self, vault: &Address, amount: Amount) -> anyhow::Result<Amount>;

    /// Harvest and value `vault`'s position against the debt it carries.
    async fn report(&self, vault: &Address, current_debt: Amount) -> anyhow::Result<StrategyReport> {
        let managed = self.total_managed_value(vault).await?;
        Ok(StrategyReport::from_value(managed, current_debt))
    }
}

/// Live adapters keyed by strategy address.
#[derive(Default)]
pub struct StrategyRegistry {
    adapters: RwLock<HashMap<Address, Arc<dyn Strategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an adapter under its own address.
    pub fn register(&self, adapter: Arc<dyn Strategy>) {
        let key = adapter.address().clone();
        self.adapters.write().insert(key, adapter);
    }

    pub fn get(&self, address: &Address) -> Option<Arc<dyn Strategy>> {
        self.adapters.read().get(address).cloned()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.adapters.read().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let adapters = self.adapters.read();
        let mut keys: Vec<&Address> = adapters.keys().collect();
        keys.sort();
        f.debug_struct("StrategyRegistry")
            .field("adapters", &keys)
            .finish()
    }
}
