//! In-memory vault ledger
//!
//! Pure accounting over one vault: idle funds, strategy debt, the share
//! ledger and the profit lock. No I/O happens here; [`crate::vault::Vault`]
//! stages a clone of this state, applies an operation to the clone, persists
//! it and only then swaps it in.
//!
//! # Invariants
//!
//! 1. `total_debt == sum(strategies[*].current_debt)`
//! 2. `total_supply == sum(balances[*])`
//! 3. `total_assets(now) == total_idle + total_debt - locked_profit(now)`

use std::collections::{BTreeSet, HashMap};

use crate::clock::Timestamp;
use crate::vault::error::{VaultError, VaultResult};
use crate::vault::math::{mul_div, Amount, Rounding};
use crate::vault::profit::ProfitUnlock;
use crate::vault::queue::DefaultQueue;
use crate::vault::types::{Address, StrategyRecord};

/// Share-ledger rows touched since the state was staged.
#[derive(Debug, Clone, Default)]
pub struct DirtyRows {
    pub holders: BTreeSet<Address>,
    pub allowances: BTreeSet<(Address, Address)>,
}

#[derive(Debug, Clone, Default)]
pub struct VaultState {
    pub total_idle: Amount,
    pub total_debt: Amount,
    pub total_supply: Amount,
    pub balances: HashMap<Address, Amount>,
    /// (owner, spender) -> shares
    pub allowances: HashMap<(Address, Address), Amount>,
    pub strategies: HashMap<Address, StrategyRecord>,
    pub default_queue: DefaultQueue,
    pub profit_unlock: ProfitUnlock,
    pub profit_max_unlock_time: u64,
    dirty: DirtyRows,
}

impl VaultState {
    pub fn new(profit_max_unlock_time: u64) -> Self {
        Self {
            profit_max_unlock_time,
            ..Default::default()
        }
    }

    // =========================================================================
    // EXCHANGE RATE
    // =========================================================================

    pub fn locked_profit(&self, now: Timestamp) -> Amount {
        self.profit_unlock.locked(now)
    }

    pub fn total_assets(&self, now: Timestamp) -> Amount {
        self.total_idle
            .saturating_add(self.total_debt)
            .saturating_sub(self.locked_profit(now))
    }

    pub fn convert_to_shares(
        &self,
        assets: Amount,
        now: Timestamp,
        rounding: Rounding,
    ) -> VaultResult<Amount> {
        if self.total_supply == 0 {
            return Ok(assets);
        }
        let total_assets = self.total_assets(now);
        if total_assets == 0 {
            // Supply outstanding against nothing: no new shares can be priced
            return Ok(0);
        }
        mul_div(assets, self.total_supply, total_assets, rounding)
            .ok_or_else(|| VaultError::invalid_amount("share conversion overflow"))
    }

    pub fn convert_to_assets(
        &self,
        shares: Amount,
        now: Timestamp,
        rounding: Rounding,
    ) -> VaultResult<Amount> {
        if self.total_supply == 0 {
            return Ok(shares);
        }
        mul_div(shares, self.total_assets(now), self.total_supply, rounding)
            .ok_or_else(|| VaultError::invalid_amount("asset conversion overflow"))
    }

    /// Shares minted for `assets` (rounds down, in the vault's favour).
    pub fn preview_deposit(&self, assets: Amount, now: Timestamp) -> VaultResult<Amount> {
        self.convert_to_shares(assets, now, Rounding::Down)
    }

    /// Assets pulled to mint `shares` (rounds up).
    pub fn preview_mint(&self, shares: Amount, now: Timestamp) -> VaultResult<Amount> {
        self.convert_to_assets(shares, now, Rounding::Up)
    }

    /// Shares burned to release `assets` (rounds up).
    pub fn preview_withdraw(&self, assets: Amount, now: Timestamp) -> VaultResult<Amount> {
        if self.total_supply > 0 && self.total_assets(now) == 0 {
            return Err(VaultError::invalid_amount("vault holds no assets"));
        }
        self.convert_to_shares(assets, now, Rounding::Up)
    }

    /// Assets released for burning `shares` (rounds down).
    pub fn preview_redeem(&self, shares: Amount, now: Timestamp) -> VaultResult<Amount> {
        self.convert_to_assets(shares, now, Rounding::Down)
    }

    // =========================================================================
    // SHARE LEDGER
    // =========================================================================

    pub fn balance_of(&self, holder: &Address) -> Amount {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn mint(&mut self, holder: &Address, shares: Amount) -> VaultResult<()> {
        let supply = self
            .total_supply
            .checked_add(shares)
            .ok_or_else(|| VaultError::invalid_amount("share supply overflow"))?;
        self.total_supply = supply;
        *self.balances.entry(holder.clone()).or_insert(0) += shares;
        self.dirty.holders.insert(holder.clone());
        Ok(())
    }

    pub fn burn(&mut self, holder: &Address, shares: Amount) -> VaultResult<()> {
        let balance = self.balance_of(holder);
        if balance < shares {
            return Err(VaultError::InsufficientShares {
                owner: holder.clone(),
                requested: shares,
                balance,
            });
        }
        let remaining = balance - shares;
        if remaining == 0 {
            self.balances.remove(holder);
        } else {
            self.balances.insert(holder.clone(), remaining);
        }
        self.total_supply -= shares;
        self.dirty.holders.insert(holder.clone());
        Ok(())
    }

    pub fn approve(&mut self, owner: &Address, spender: &Address, shares: Amount) {
        let key = (owner.clone(), spender.clone());
        if shares == 0 {
            self.allowances.remove(&key);
        } else {
            self.allowances.insert(key.clone(), shares);
        }
        self.dirty.allowances.insert(key);
    }

    /// Consume allowance when `spender` acts for `owner`. Owners spend freely.
    pub fn spend_allowance(
        &mut self,
        owner: &Address,
        spender: &Address,
        shares: Amount,
    ) -> VaultResult<()> {
        if owner == spender {
            return Ok(());
        }
        let current = self.allowance(owner, spender);
        if current < shares {
            return Err(VaultError::Unauthorized {
                caller: spender.clone(),
            });
        }
        self.approve(owner, spender, current - shares);
        Ok(())
    }

    /// Rows the store must rewrite for this state. Clears the set.
    pub fn take_dirty(&mut self) -> DirtyRows {
        std::mem::take(&mut self.dirty)
    }

    // =========================================================================
    // STRATEGY LEDGER
    // =========================================================================

    pub fn strategy(&self, id: &Address) -> Option<&StrategyRecord> {
        self.strategies.get(id)
    }

    pub fn active_strategy(&self, id: &Address) -> VaultResult<StrategyRecord> {
        match self.strategies.get(id) {
            Some(rec) if rec.is_active() => Ok(*rec),
            _ => Err(VaultError::InactiveStrategy {
                strategy: id.clone(),
            }),
        }
    }

    /// Move `amount` from idle into a strategy's debt.
    pub fn allocate(&mut self, id: &Address, amount: Amount) {
        if let Some(rec) = self.strategies.get_mut(id) {
            rec.current_debt += amount;
            self.total_debt += amount;
            self.total_idle -= amount;
        }
    }

    /// Move `returned` funds from a strategy's debt back to idle.
    ///
    /// Debt comes down only by what actually arrived. Anything the strategy
    /// lost on the way stays as debt until its next report books the loss.
    pub fn deallocate(&mut self, id: &Address, returned: Amount) {
        if let Some(rec) = self.strategies.get_mut(id) {
            let repaid = returned.min(rec.current_debt);
            rec.current_debt -= repaid;
            self.total_debt -= repaid;
            self.total_idle += returned;
        }
    }

    /// Sum of strategy debt, recomputed from the records.
    pub fn summed_debt(&self) -> Amount {
        self.strategies.values().map(|r| r.current_debt).sum()
    }

    /// Sum of share balances, recomputed from the ledger.
    pub fn summed_balances(&self) -> Amount {
        self.balances.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::new("alice")
    }

    fn funded(idle: Amount, supply: Amount) -> VaultState {
        let mut state = VaultState::new(7 * 86_400);
        state.total_idle = idle;
        state.mint(&alice(), supply).unwrap();
        state
    }

    #[test]
    fn test_empty_vault_is_one_to_one() {
        let state = VaultState::new(0);
        assert_eq!(state.preview_deposit(1_000, 0).unwrap(), 1_000);
        assert_eq!(state.preview_redeem(1_000, 0).unwrap(), 1_000);
    }

    #[test]
    fn test_rounding_favours_vault() {
        // 3 shares backed by 10 assets
        let state = funded(10, 3);
        // deposit 4 -> 4*3/10 = 1.2 -> 1 share
        assert_eq!(state.preview_deposit(4, 0).unwrap(), 1);
        // mint 1 share -> 10/3 = 3.33 -> 4 assets
        assert_eq!(state.preview_mint(1, 0).unwrap(), 4);
        // withdraw 4 assets -> 1.2 -> 2 shares
        assert_eq!(state.preview_withdraw(4, 0).unwrap(), 2);
        // redeem 1 share -> 3.33 -> 3 assets
        assert_eq!(state.preview_redeem(1, 0).unwrap(), 3);
    }

    #[test]
    fn test_round_trip_never_gains() {
        let state = funded(1_000_003, 999_997);
        for x in [1u128, 7, 999, 12_345, 500_000] {
            let shares = state.convert_to_shares(x, 0, Rounding::Down).unwrap();
            let back = state.convert_to_assets(shares, 0, Rounding::Down).unwrap();
            assert!(back <= x);
            assert!(x - back <= 2, "x={} back={}", x, back);
        }
    }

    #[test]
    fn test_locked_profit_excluded_from_total_assets() {
        let mut state = funded(1_000, 1_000);
        state.total_idle += 100;
        state.profit_unlock.lock_gain(100, 0, 7 * 86_400);

        assert_eq!(state.total_assets(0), 1_000);
        assert_eq!(state.total_assets(7 * 86_400), 1_100);
    }

    #[test]
    fn test_burn_checks_balance_and_tracks_rows() {
        let mut state = funded(100, 100);
        state.take_dirty();

        let err = state.burn(&alice(), 101).unwrap_err();
        assert!(matches!(err, VaultError::InsufficientShares { balance: 100, .. }));

        state.burn(&alice(), 100).unwrap();
        assert_eq!(state.total_supply, 0);
        assert_eq!(state.balance_of(&alice()), 0);
        let dirty = state.take_dirty();
        assert!(dirty.holders.contains(&alice()));
    }

    #[test]
    fn test_deallocate_repays_only_what_arrived() {
        let mut state = funded(0, 100);
        let s1 = Address::new("0xs1");
        state.strategies.insert(
            s1.clone(),
            StrategyRecord {
                activation: 1,
                max_debt: 100,
                ..Default::default()
            },
        );
        state.total_idle = 100;
        state.allocate(&s1, 100);

        state.deallocate(&s1, 90);
        assert_eq!(state.strategy(&s1).unwrap().current_debt, 10);
        assert_eq!(state.total_debt, 10);
        assert_eq!(state.total_idle, 90);
        assert_eq!(state.summed_debt(), state.total_debt);
    }

    #[test]
    fn test_spend_allowance() {
        let mut state = funded(100, 100);
        let bob = Address::new("bob");

        assert!(state.spend_allowance(&alice(), &bob, 10).is_err());
        state.approve(&alice(), &bob, 30);
        state.spend_allowance(&alice(), &bob, 10).unwrap();
        assert_eq!(state.allowance(&alice(), &bob), 20);
        state.spend_allowance(&alice(), &alice(), 1_000).unwrap();
    }

    #[test]
    fn test_allocate_and_deallocate_keep_debt_in_sync() {
        let mut state = funded(1_000, 1_000);
        let s = Address::new("s1");
        state.strategies.insert(
            s.clone(),
            StrategyRecord {
                activation: 1,
                max_debt: 600,
                ..Default::default()
            },
        );

        state.allocate(&s, 500);
        assert_eq!(state.total_idle, 500);
        assert_eq!(state.total_debt, 500);
        assert_eq!(state.summed_debt(), state.total_debt);

        // 190 arrived; the rest stays as debt until reported
        state.deallocate(&s, 190);
        assert_eq!(state.total_debt, 310);
        assert_eq!(state.total_idle, 690);
        assert_eq!(state.total_assets(0), 1_000);
        assert_eq!(state.summed_debt(), state.total_debt);
    }
}
