//! In-memory strategy adapter
//!
//! Holds its funds as a plain balance in an [`InMemoryAssetLedger`] and keeps
//! per-vault units against that balance, so several vaults can share one
//! adapter and each owns a pro-rata slice. Gains and losses are simulated by
//! minting into or burning from the balance, which moves every slice.
//! Liquidity caps, deposit caps, withdrawal haircuts and hard failures can be
//! switched on to drive the vault's edge paths.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::assets::InMemoryAssetLedger;
use crate::strategy::Strategy;
use crate::vault::math::{mul_div, Amount, Rounding};
use crate::vault::types::Address;

const MAX_BPS: u128 = 10_000;

#[derive(Debug, Default)]
struct MockBook {
    /// Most that can be withdrawn at once
    liquidity_cap: Option<Amount>,
    /// Most the strategy will hold in total
    deposit_cap: Option<Amount>,
    /// Share of each withdrawal lost in transit
    withdraw_haircut_bps: u32,
    failing: bool,
    units: HashMap<Address, Amount>,
    total_units: Amount,
}

/// Outcome of a withdrawal, computed before anything moves.
struct Exit {
    units: Amount,
    released: Amount,
    delivered: Amount,
}

impl MockBook {
    fn value_of(&self, vault: &Address, balance: Amount) -> Result<Amount> {
        let units = self.units.get(vault).copied().unwrap_or(0);
        if units == 0 {
            return Ok(0);
        }
        mul_div(units, balance, self.total_units, Rounding::Down).context("position value overflow")
    }

    fn withdrawable(&self, vault: &Address, balance: Amount) -> Result<Amount> {
        let value = self.value_of(vault, balance)?;
        Ok(self.liquidity_cap.map_or(value, |cap| cap.min(value)))
    }

    fn exit(&self, vault: &Address, amount: Amount, balance: Amount) -> Result<Exit> {
        let held = self.units.get(vault).copied().unwrap_or(0);
        let value = self.value_of(vault, balance)?;
        let released = amount.min(self.withdrawable(vault, balance)?);
        let units = if released == value {
            held
        } else {
            mul_div(released, self.total_units, balance, Rounding::Up)
                .context("unit overflow")?
                .min(held)
        };
        let haircut = released * self.withdraw_haircut_bps as u128 / MAX_BPS;
        Ok(Exit {
            units,
            released,
            delivered: released - haircut,
        })
    }
}

pub struct MockStrategy {
    address: Address,
    asset: Address,
    ledger: Arc<InMemoryAssetLedger>,
    book: Mutex<MockBook>,
}

impl MockStrategy {
    pub fn new(address: Address, asset: Address, ledger: Arc<InMemoryAssetLedger>) -> Self {
        Self {
            address,
            asset,
            ledger,
            book: Mutex::new(MockBook::default()),
        }
    }

    /// Yield appears in the strategy's balance.
    pub fn simulate_gain(&self, amount: Amount) {
        self.ledger.mint(&self.asset, &self.address, amount);
    }

    /// Funds disappear from the strategy's balance.
    pub fn simulate_loss(&self, amount: Amount) -> Amount {
        self.ledger.burn(&self.asset, &self.address, amount)
    }

    pub fn set_liquidity_cap(&self, cap: Option<Amount>) {
        self.book.lock().liquidity_cap = cap;
    }

    pub fn set_deposit_cap(&self, cap: Option<Amount>) {
        self.book.lock().deposit_cap = cap;
    }

    pub fn set_withdraw_haircut_bps(&self, bps: u32) {
        self.book.lock().withdraw_haircut_bps = bps.min(MAX_BPS as u32);
    }

    pub fn set_failing(&self, failing: bool) {
        self.book.lock().failing = failing;
    }

    /// Everything the strategy holds, across all vaults.
    pub fn balance(&self) -> Amount {
        self.ledger.balance(&self.asset, &self.address)
    }

    /// Current worth of one vault's slice.
    pub fn position(&self, vault: &Address) -> Amount {
        self.book
            .lock()
            .value_of(vault, self.balance())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Strategy for MockStrategy {
    fn address(&self) -> &Address {
        &self.address
    }

    fn asset(&self) -> &Address {
        &self.asset
    }

    async fn total_managed_value(&self, vault: &Address) -> Result<Amount> {
        let book = self.book.lock();
        if book.failing {
            bail!("strategy {} unavailable", self.address);
        }
        book.value_of(vault, self.balance())
    }

    async fn max_withdraw(&self, vault: &Address) -> Result<Amount> {
        let book = self.book.lock();
        if book.failing {
            bail!("strategy {} unavailable", self.address);
        }
        book.withdrawable(vault, self.balance())
    }

    async fn preview_withdraw(&self, vault: &Address, amount: Amount) -> Result<Amount> {
        let book = self.book.lock();
        if book.failing {
            bail!("strategy {} unavailable", self.address);
        }
        Ok(book.exit(vault, amount, self.balance())?.delivered)
    }

    async fn deposit(&self, vault: &Address, amount: Amount) -> Result<Amount> {
        let mut book = self.book.lock();
        if book.failing {
            bail!("strategy {} rejected deposit", self.address);
        }
        let balance = self.balance();
        let accepted = match book.deposit_cap {
            Some(cap) => amount.min(cap.saturating_sub(balance)),
            None => amount,
        };
        if accepted == 0 {
            return Ok(0);
        }

        if balance == 0 {
            // whatever units remain are worthless
            book.units.clear();
            book.total_units = 0;
        }
        let units = if book.total_units == 0 {
            accepted
        } else {
            mul_div(accepted, book.total_units, balance, Rounding::Down).context("unit overflow")?
        };

        self.ledger
            .move_funds(&self.asset, vault, &self.address, accepted)?;
        *book.units.entry(vault.clone()).or_insert(0) += units;
        book.total_units += units;
        Ok(accepted)
    }

    async fn withdraw(&self, vault: &Address, amount: Amount) -> Result<Amount> {
        let mut book = self.book.lock();
        if book.failing {
            bail!("strategy {} rejected withdrawal", self.address);
        }
        let exit = book.exit(vault, amount, self.balance())?;
        if exit.released == 0 {
            return Ok(0);
        }

        self.ledger
            .move_funds(&self.asset, &self.address, vault, exit.delivered)?;
        self.ledger
            .burn(&self.asset, &self.address, exit.released - exit.delivered);
        let remaining = {
            let held = book.units.entry(vault.clone()).or_insert(0);
            *held -= exit.units;
            *held
        };
        if remaining == 0 {
            book.units.remove(vault);
        }
        book.total_units -= exit.units;
        Ok(exit.delivered)
    }
}
