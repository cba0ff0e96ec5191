//! Pooled vault
//!
//! One vault per asset. Depositors hold shares; idle funds sit in the vault's
//! own custody account and the rest is lent to strategies as debt.
//!
//! Every mutating operation runs under the vault's state lock and follows the
//! same sequence: stage a copy of the ledger, apply the change to the copy,
//! persist it in one store transaction, then swap it in and emit events. A
//! failed step leaves the live ledger untouched.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::assets::AssetTransfer;
use crate::clock::{Clock, Timestamp};
use crate::strategy::{Strategy, StrategyRegistry, StrategyReport};
use crate::vault::error::{VaultError, VaultResult};
use crate::vault::events::{EventBus, VaultActivityRecord, VaultEvent};
use crate::vault::math::{Amount, Rounding};
use crate::vault::queue::DefaultQueue;
use crate::vault::state::{DirtyRows, VaultState};
use crate::vault::types::{Address, InitialStrategy, StrategyRecord, VaultParams};
use crate::vault::vault_db::{StoredVault, VaultDb, VaultWrite};

/// Services every vault shares with its factory.
#[derive(Clone)]
pub struct VaultContext {
    pub db: VaultDb,
    pub assets: Arc<dyn AssetTransfer>,
    pub strategies: Arc<StrategyRegistry>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub max_profit_unlock_time: u64,
}

/// Point-in-time view of one vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub vault: Address,
    pub index: u64,
    pub asset: Address,
    pub agent_name: String,
    pub name: String,
    pub symbol: String,
    pub governance: Address,
    pub total_assets: Amount,
    pub total_idle: Amount,
    pub total_debt: Amount,
    pub total_supply: Amount,
    pub locked_profit: Amount,
    pub profit_unlocking_rate: Amount,
    pub full_profit_unlock_date: Timestamp,
    pub profit_max_unlock_time: u64,
    pub default_queue: Vec<Address>,
    pub ts: Timestamp,
}

pub struct Vault {
    id: Address,
    index: u64,
    governance: Address,
    params: VaultParams,
    created_at: Timestamp,
    state: Mutex<VaultState>,
    ctx: VaultContext,
}

impl Vault {
    pub fn new(record: StoredVault, state: VaultState, ctx: VaultContext) -> Self {
        Self {
            id: record.vault_id,
            index: record.index,
            governance: record.governance,
            params: record.params,
            created_at: record.created_at,
            state: Mutex::new(state),
            ctx,
        }
    }

    pub fn id(&self) -> &Address {
        &self.id
    }

    /// Creation sequence number in the factory registry.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn asset(&self) -> &Address {
        &self.params.asset
    }

    pub fn name(&self) -> &str {
        &self.params.token_name
    }

    pub fn symbol(&self) -> &str {
        &self.params.token_symbol
    }

    pub fn governance(&self) -> &Address {
        &self.governance
    }

    pub fn params(&self) -> &VaultParams {
        &self.params
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    // =========================================================================
    // DEPOSITS
    // =========================================================================

    /// Pull `assets` from `caller` and mint shares to `receiver`.
    pub async fn deposit(
        &self,
        caller: &Address,
        assets: Amount,
        receiver: &Address,
    ) -> VaultResult<Amount> {
        if assets == 0 {
            return Err(VaultError::invalid_amount("deposit of zero assets"));
        }
        ensure_account(receiver, "receiver")?;

        let mut state = self.state.lock().await;
        let shares = state.preview_deposit(assets, self.ctx.clock.now())?;
        if shares == 0 {
            return Err(VaultError::invalid_amount("deposit rounds to zero shares"));
        }
        self.deposit_locked(&mut state, caller, receiver, assets, shares)
            .await?;
        Ok(shares)
    }

    /// Mint exactly `shares` to `receiver`, pulling the rounded-up asset cost
    /// from `caller`.
    pub async fn mint(
        &self,
        caller: &Address,
        shares: Amount,
        receiver: &Address,
    ) -> VaultResult<Amount> {
        if shares == 0 {
            return Err(VaultError::invalid_amount("mint of zero shares"));
        }
        ensure_account(receiver, "receiver")?;

        let mut state = self.state.lock().await;
        let assets = state.preview_mint(shares, self.ctx.clock.now())?;
        if assets == 0 {
            return Err(VaultError::invalid_amount("mint prices to zero assets"));
        }
        self.deposit_locked(&mut state, caller, receiver, assets, shares)
            .await?;
        Ok(assets)
    }

    async fn deposit_locked(
        &self,
        state: &mut VaultState,
        caller: &Address,
        receiver: &Address,
        assets: Amount,
        shares: Amount,
    ) -> VaultResult<()> {
        let mut staged = state.clone();
        staged.mint(receiver, shares)?;
        staged.total_idle = staged
            .total_idle
            .checked_add(assets)
            .ok_or_else(|| VaultError::invalid_amount("idle balance overflow"))?;

        self.ctx
            .assets
            .transfer(self.asset(), caller, &self.id, assets)
            .await
            .map_err(|e| VaultError::TransferFailed { reason: e.reason })?;

        if let Err(err) = self.persist(&mut staged).await {
            self.refund(caller, assets).await;
            return Err(err);
        }
        *state = staged;

        info!(
            "Vault {} deposit: {} assets from {} -> {} shares to {}",
            self.id, assets, caller, shares, receiver
        );
        self.emit(vec![VaultEvent::Deposit {
            vault: self.id.clone(),
            sender: caller.clone(),
            owner: receiver.clone(),
            assets,
            shares,
        }])
        .await;
        Ok(())
    }

    async fn refund(&self, to: &Address, assets: Amount) {
        if let Err(e) = self
            .ctx
            .assets
            .transfer(self.asset(), &self.id, to, assets)
            .await
        {
            error!(
                "Vault {} could not refund {} to {}: {}",
                self.id, assets, to, e
            );
        }
    }

    // =========================================================================
    // WITHDRAWALS
    // =========================================================================

    /// Release exactly `assets` to `receiver`, burning the rounded-up share
    /// cost from `owner`. Returns the shares burned.
    pub async fn withdraw(
        &self,
        caller: &Address,
        assets: Amount,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<Amount> {
        if assets == 0 {
            return Err(VaultError::invalid_amount("withdrawal of zero assets"));
        }
        ensure_account(receiver, "receiver")?;

        let mut state = self.state.lock().await;
        let shares = state.preview_withdraw(assets, self.ctx.clock.now())?;
        check_share_access(&state, caller, owner, shares)?;

        self.ensure_liquidity(&mut state, assets).await?;

        self.withdraw_locked(&mut state, caller, receiver, owner, assets, shares)
            .await?;
        Ok(shares)
    }

    /// Burn exactly `shares` from `owner` and release the rounded-down asset
    /// value to `receiver`. Returns the assets released.
    pub async fn redeem(
        &self,
        caller: &Address,
        shares: Amount,
        receiver: &Address,
        owner: &Address,
    ) -> VaultResult<Amount> {
        if shares == 0 {
            return Err(VaultError::invalid_amount("redemption of zero shares"));
        }
        ensure_account(receiver, "receiver")?;

        let mut state = self.state.lock().await;
        check_share_access(&state, caller, owner, shares)?;
        let assets = state.preview_redeem(shares, self.ctx.clock.now())?;
        if assets == 0 {
            return Err(VaultError::invalid_amount("redemption rounds to zero assets"));
        }

        self.ensure_liquidity(&mut state, assets).await?;

        self.withdraw_locked(&mut state, caller, receiver, owner, assets, shares)
            .await?;
        Ok(assets)
    }

    async fn withdraw_locked(
        &self,
        state: &mut VaultState,
        caller: &Address,
        receiver: &Address,
        owner: &Address,
        assets: Amount,
        shares: Amount,
    ) -> VaultResult<()> {
        let mut staged = state.clone();
        staged.spend_allowance(owner, caller, shares)?;
        staged.burn(owner, shares)?;
        if staged.total_idle < assets {
            return Err(VaultError::InsufficientLiquidity {
                requested: assets,
                available: staged.total_idle,
            });
        }
        staged.total_idle -= assets;

        // Shares are burned on disk before any funds leave custody
        let dirty = staged.take_dirty();
        self.save(&staged, &dirty).await?;

        if let Err(e) = self
            .ctx
            .assets
            .transfer(self.asset(), &self.id, receiver, assets)
            .await
        {
            if let Err(restore) = self.save(state, &dirty).await {
                error!(
                    "Vault {} failed to restore ledger after refused payout: {}",
                    self.id, restore
                );
            }
            return Err(VaultError::TransferFailed { reason: e.reason });
        }
        *state = staged;

        info!(
            "Vault {} withdraw: {} shares of {} -> {} assets to {}",
            self.id, shares, owner, assets, receiver
        );
        self.emit(vec![VaultEvent::Withdraw {
            vault: self.id.clone(),
            sender: caller.clone(),
            receiver: receiver.clone(),
            owner: owner.clone(),
            assets,
            shares,
        }])
        .await;
        Ok(())
    }

    /// Make sure `needed` is sitting idle, pulling the shortfall from the
    /// default queue in order.
    ///
    /// The pull is planned against each strategy's own quote, and fails with
    /// `InsufficientLiquidity` before any funds move when the quotes cannot
    /// cover the shortfall. Pulls only swap debt for idle funds, so if an
    /// adapter later delivers less than it quoted, the pulls already made are
    /// still committed (share value is unchanged) and the shortfall is
    /// reported as an error.
    pub(crate) async fn ensure_liquidity(
        &self,
        state: &mut VaultState,
        needed: Amount,
    ) -> VaultResult<()> {
        if state.total_idle >= needed {
            return Ok(());
        }

        let mut plan: Vec<(Address, Arc<dyn Strategy>, Amount, Amount)> = Vec::new();
        let mut available = state.total_idle;
        for (id, adapter, withdrawable) in self.withdrawable_by_queue(state).await {
            if available >= needed {
                break;
            }
            let take = withdrawable.min(needed - available);
            if take == 0 {
                continue;
            }
            match adapter.preview_withdraw(&self.id, take).await {
                Ok(quote) if quote > 0 => {
                    available += quote;
                    plan.push((id, adapter, take, quote));
                }
                Ok(_) => {}
                Err(e) => warn!("Vault {} no quote from {}: {:#}", self.id, id, e),
            }
        }
        if available < needed {
            return Err(VaultError::InsufficientLiquidity {
                requested: needed,
                available,
            });
        }

        let mut staged = state.clone();
        let mut events = Vec::new();
        let mut failure = None;
        for (id, adapter, take, quote) in plan {
            let current_debt = staged.strategy(&id).map_or(0, |r| r.current_debt);
            match adapter.withdraw(&self.id, take).await {
                Ok(returned) => {
                    if returned < quote {
                        warn!(
                            "Vault {} got {} from {}, quoted {}",
                            self.id, returned, id, quote
                        );
                    }
                    staged.deallocate(&id, returned);
                    let new_debt = staged.strategy(&id).map_or(0, |r| r.current_debt);
                    debug!("Vault {} pulled {} from {}", self.id, returned, id);
                    events.push(VaultEvent::DebtUpdated {
                        vault: self.id.clone(),
                        strategy: id,
                        current_debt,
                        new_debt,
                    });
                }
                Err(e) => {
                    failure = Some(VaultError::strategy_failed(&id, e));
                    break;
                }
            }
        }

        if !events.is_empty() {
            self.persist(&mut staged).await?;
            *state = staged;
            self.emit(events).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if state.total_idle < needed {
            return Err(VaultError::InsufficientLiquidity {
                requested: needed,
                available: state.total_idle,
            });
        }
        Ok(())
    }

    /// Active queue members with how much of this vault's position each
    /// could release right now, capped at its recorded debt. Adapters that
    /// cannot answer count as empty.
    async fn withdrawable_by_queue(
        &self,
        state: &VaultState,
    ) -> Vec<(Address, Arc<dyn Strategy>, Amount)> {
        let mut out = Vec::with_capacity(state.default_queue.len());
        for id in state.default_queue.iter() {
            let debt = match state.strategy(id) {
                Some(rec) if rec.is_active() && rec.current_debt > 0 => rec.current_debt,
                _ => continue,
            };
            let Some(adapter) = self.ctx.strategies.get(id) else {
                warn!("Vault {} queue entry {} has no adapter", self.id, id);
                continue;
            };
            match adapter.max_withdraw(&self.id).await {
                Ok(max) => out.push((id.clone(), adapter, max.min(debt))),
                Err(e) => warn!("Vault {} skipping {}: {:#}", self.id, id, e),
            }
        }
        out
    }

    /// Idle funds plus what the queue quotes it would deliver.
    async fn available_liquidity(&self, state: &VaultState) -> Amount {
        let mut available = state.total_idle;
        for (id, adapter, withdrawable) in self.withdrawable_by_queue(state).await {
            match adapter.preview_withdraw(&self.id, withdrawable).await {
                Ok(quote) => available = available.saturating_add(quote),
                Err(e) => warn!("Vault {} no quote from {}: {:#}", self.id, id, e),
            }
        }
        available
    }

    pub async fn max_withdraw(&self, owner: &Address) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        let owned = state.preview_redeem(state.balance_of(owner), self.ctx.clock.now())?;
        Ok(owned.min(self.available_liquidity(&state).await))
    }

    pub async fn max_redeem(&self, owner: &Address) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        let now = self.ctx.clock.now();
        let balance = state.balance_of(owner);
        let owned = state.preview_redeem(balance, now)?;
        let liquid = self.available_liquidity(&state).await;
        if owned <= liquid {
            return Ok(balance);
        }
        Ok(state
            .convert_to_shares(liquid, now, Rounding::Down)?
            .min(balance))
    }

    // =========================================================================
    // ALLOWANCES
    // =========================================================================

    pub async fn approve(
        &self,
        owner: &Address,
        spender: &Address,
        shares: Amount,
    ) -> VaultResult<()> {
        ensure_account(spender, "spender")?;
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        staged.approve(owner, spender, shares);
        self.commit(
            &mut state,
            staged,
            vec![VaultEvent::Approval {
                vault: self.id.clone(),
                owner: owner.clone(),
                spender: spender.clone(),
                shares,
            }],
        )
        .await
    }

    pub async fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.state.lock().await.allowance(owner, spender)
    }

    // =========================================================================
    // STRATEGY LEDGER (governance only)
    // =========================================================================

    pub async fn add_strategy(
        &self,
        caller: &Address,
        strategy: &Address,
        add_to_queue: bool,
    ) -> VaultResult<()> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let init = InitialStrategy {
            strategy: strategy.clone(),
            max_debt: 0,
            add_to_queue,
        };
        let events = stage_strategy(
            &mut staged,
            &self.ctx.strategies,
            &self.id,
            self.asset(),
            &init,
            self.ctx.clock.now(),
        )?;
        self.commit(&mut state, staged, events).await?;
        info!("Vault {} added strategy {}", self.id, strategy);
        Ok(())
    }

    /// Deactivate a strategy that holds no debt and drop it from the queue.
    pub async fn revoke_strategy(&self, caller: &Address, strategy: &Address) -> VaultResult<()> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        let record = state.active_strategy(strategy)?;
        if record.current_debt > 0 {
            return Err(VaultError::StrategyHasDebt {
                strategy: strategy.clone(),
                current_debt: record.current_debt,
            });
        }

        let mut staged = state.clone();
        staged.strategies.remove(strategy);
        let mut events = vec![VaultEvent::StrategyRevoked {
            vault: self.id.clone(),
            strategy: strategy.clone(),
        }];
        if staged.default_queue.remove(strategy) {
            events.push(self.queue_event(&staged.default_queue));
        }
        self.commit(&mut state, staged, events).await?;
        info!("Vault {} revoked strategy {}", self.id, strategy);
        Ok(())
    }

    pub async fn set_max_debt(
        &self,
        caller: &Address,
        strategy: &Address,
        new_max_debt: Amount,
    ) -> VaultResult<()> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        state.active_strategy(strategy)?;

        let mut staged = state.clone();
        if let Some(rec) = staged.strategies.get_mut(strategy) {
            rec.max_debt = new_max_debt;
        }
        self.commit(
            &mut state,
            staged,
            vec![VaultEvent::UpdatedMaxDebt {
                vault: self.id.clone(),
                strategy: strategy.clone(),
                new_max_debt,
            }],
        )
        .await?;
        info!(
            "Vault {} max debt of {} set to {}",
            self.id, strategy, new_max_debt
        );
        Ok(())
    }

    /// Move a strategy's debt toward `target_debt`. Returns the debt after
    /// the move.
    ///
    /// Increases are capped by the ceiling and by idle funds. Decreases ask
    /// the strategy for as much as it can release, and fail with
    /// `SlippageExceeded` before anything moves when its quote is below
    /// `min_out`. Debt is reduced by what actually arrives; any shortfall is
    /// booked as a loss by the next report.
    pub async fn rebalance_debt(
        &self,
        caller: &Address,
        strategy: &Address,
        target_debt: Amount,
        min_out: Amount,
    ) -> VaultResult<Amount> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        let record = state.active_strategy(strategy)?;
        let adapter = self.adapter(strategy)?;

        if target_debt > record.current_debt {
            self.increase_debt(&mut state, strategy, &record, adapter, target_debt)
                .await
        } else if target_debt < record.current_debt {
            self.decrease_debt(&mut state, strategy, &record, adapter, target_debt, min_out)
                .await
        } else {
            debug!("Vault {} debt of {} already at target", self.id, strategy);
            Ok(record.current_debt)
        }
    }

    async fn increase_debt(
        &self,
        state: &mut VaultState,
        strategy: &Address,
        record: &StrategyRecord,
        adapter: Arc<dyn Strategy>,
        target_debt: Amount,
    ) -> VaultResult<Amount> {
        let headroom = record.headroom();
        if headroom == 0 {
            return Err(VaultError::DebtCeilingExceeded {
                strategy: strategy.clone(),
                current_debt: record.current_debt,
                max_debt: record.max_debt,
            });
        }
        let amount = (target_debt - record.current_debt)
            .min(headroom)
            .min(state.total_idle);
        if amount == 0 {
            debug!("Vault {} has no idle funds for {}", self.id, strategy);
            return Ok(record.current_debt);
        }

        let accepted = adapter
            .deposit(&self.id, amount)
            .await
            .map_err(|e| VaultError::strategy_failed(strategy, e))?
            .min(amount);

        let mut staged = state.clone();
        staged.allocate(strategy, accepted);
        let new_debt = record.current_debt + accepted;
        if let Err(err) = self.persist(&mut staged).await {
            if let Err(e) = adapter.withdraw(&self.id, accepted).await {
                error!(
                    "Vault {} could not unwind {} from {}: {:#}",
                    self.id, accepted, strategy, e
                );
            }
            return Err(err);
        }
        *state = staged;

        info!(
            "Vault {} debt of {}: {} -> {}",
            self.id, strategy, record.current_debt, new_debt
        );
        self.emit(vec![VaultEvent::DebtUpdated {
            vault: self.id.clone(),
            strategy: strategy.clone(),
            current_debt: record.current_debt,
            new_debt,
        }])
        .await;
        Ok(new_debt)
    }

    async fn decrease_debt(
        &self,
        state: &mut VaultState,
        strategy: &Address,
        record: &StrategyRecord,
        adapter: Arc<dyn Strategy>,
        target_debt: Amount,
        min_out: Amount,
    ) -> VaultResult<Amount> {
        let withdrawable = adapter
            .max_withdraw(&self.id)
            .await
            .map_err(|e| VaultError::strategy_failed(strategy, e))?;
        let request = (record.current_debt - target_debt).min(withdrawable);
        let quote = if request == 0 {
            0
        } else {
            adapter
                .preview_withdraw(&self.id, request)
                .await
                .map_err(|e| VaultError::strategy_failed(strategy, e))?
        };
        if quote < min_out {
            return Err(VaultError::SlippageExceeded {
                strategy: strategy.clone(),
                returned: quote,
                min_out,
            });
        }
        if request == 0 {
            debug!("Vault {} nothing withdrawable from {}", self.id, strategy);
            return Ok(record.current_debt);
        }

        let returned = adapter
            .withdraw(&self.id, request)
            .await
            .map_err(|e| VaultError::strategy_failed(strategy, e))?;

        if returned < min_out {
            // Delivered below its own quote; hand the funds back.
            let mut staged = state.clone();
            staged.deallocate(strategy, returned);
            if returned > 0 {
                match adapter.deposit(&self.id, returned).await {
                    Ok(accepted) => staged.allocate(strategy, accepted.min(returned)),
                    Err(e) => error!(
                        "Vault {} could not return {} to {}: {:#}",
                        self.id, returned, strategy, e
                    ),
                }
            }
            let new_debt = staged.strategy(strategy).map_or(0, |r| r.current_debt);
            if staged.total_idle != state.total_idle {
                warn!(
                    "Vault {} kept {} from {} after a short delivery",
                    self.id,
                    staged.total_idle - state.total_idle,
                    strategy
                );
                self.persist(&mut staged).await?;
                *state = staged;
                self.emit(vec![VaultEvent::DebtUpdated {
                    vault: self.id.clone(),
                    strategy: strategy.clone(),
                    current_debt: record.current_debt,
                    new_debt,
                }])
                .await;
            }
            return Err(VaultError::SlippageExceeded {
                strategy: strategy.clone(),
                returned,
                min_out,
            });
        }

        let mut staged = state.clone();
        staged.deallocate(strategy, returned);
        let new_debt = staged.strategy(strategy).map_or(0, |r| r.current_debt);
        if let Err(err) = self.persist(&mut staged).await {
            if let Err(e) = adapter.deposit(&self.id, returned).await {
                error!(
                    "Vault {} could not return {} to {}: {:#}",
                    self.id, returned, strategy, e
                );
            }
            return Err(err);
        }
        *state = staged;

        if returned < request {
            warn!(
                "Vault {} received {} of {} from {}, rest stays as debt until reported",
                self.id, returned, request, strategy
            );
        }
        info!(
            "Vault {} debt of {}: {} -> {}",
            self.id, strategy, record.current_debt, new_debt
        );
        self.emit(vec![VaultEvent::DebtUpdated {
            vault: self.id.clone(),
            strategy: strategy.clone(),
            current_debt: record.current_debt,
            new_debt,
        }])
        .await;
        Ok(new_debt)
    }

    /// Book a strategy's gain or loss since its last report.
    ///
    /// Gains raise the strategy's debt and are locked, vesting linearly over
    /// the unlock window. Losses come straight off the debt.
    pub async fn process_report(
        &self,
        caller: &Address,
        strategy: &Address,
    ) -> VaultResult<StrategyReport> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        let record = state.active_strategy(strategy)?;
        let adapter = self.adapter(strategy)?;

        let report = adapter
            .report(&self.id, record.current_debt)
            .await
            .map_err(|e| VaultError::strategy_failed(strategy, e))?;
        let now = self.ctx.clock.now();

        let mut staged = state.clone();
        let loss = report.loss.min(record.current_debt + report.gain);
        let max_unlock = staged.profit_max_unlock_time;
        if let Some(rec) = staged.strategies.get_mut(strategy) {
            rec.current_debt = rec.current_debt + report.gain - loss;
            rec.last_report = now;
        }
        staged.total_debt = staged.total_debt + report.gain - loss;
        if report.gain > 0 {
            staged.profit_unlock.lock_gain(report.gain, now, max_unlock);
        }

        let current_debt = staged.strategy(strategy).map_or(0, |r| r.current_debt);
        let event = VaultEvent::StrategyReported {
            vault: self.id.clone(),
            strategy: strategy.clone(),
            gain: report.gain,
            loss,
            current_debt,
            locked_profit: staged.locked_profit(now),
            full_profit_unlock_date: staged.profit_unlock.full_profit_unlock_date,
        };
        self.commit(&mut state, staged, vec![event]).await?;

        info!(
            "Vault {} report from {}: gain {} loss {} debt {}",
            self.id, strategy, report.gain, loss, current_debt
        );
        Ok(StrategyReport {
            gain: report.gain,
            loss,
        })
    }

    /// Replace the withdrawal order. Every entry must be active and unique.
    pub async fn set_default_queue(
        &self,
        caller: &Address,
        queue: Vec<Address>,
    ) -> VaultResult<()> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        for id in &queue {
            state.active_strategy(id)?;
        }
        let queue = DefaultQueue::from_ordered(queue)
            .map_err(|dup| VaultError::invalid_strategy(&dup, "duplicate queue entry"))?;

        let mut staged = state.clone();
        staged.default_queue = queue;
        let event = self.queue_event(&staged.default_queue);
        self.commit(&mut state, staged, vec![event]).await
    }

    /// Drop a strategy from the withdrawal order. Returns whether it was
    /// queued.
    pub async fn remove_from_queue(
        &self,
        caller: &Address,
        strategy: &Address,
    ) -> VaultResult<bool> {
        self.ensure_governance(caller)?;
        let mut state = self.state.lock().await;
        if !state.default_queue.contains(strategy) {
            return Ok(false);
        }
        let mut staged = state.clone();
        staged.default_queue.remove(strategy);
        let event = self.queue_event(&staged.default_queue);
        self.commit(&mut state, staged, vec![event]).await?;
        Ok(true)
    }

    /// Change the unlock window for future reports. Zero releases anything
    /// still locked.
    pub async fn set_profit_max_unlock_time(
        &self,
        caller: &Address,
        profit_max_unlock_time: u64,
    ) -> VaultResult<()> {
        self.ensure_governance(caller)?;
        if profit_max_unlock_time > self.ctx.max_profit_unlock_time {
            return Err(VaultError::invalid_params(format!(
                "profit_max_unlock_time {} above maximum {}",
                profit_max_unlock_time, self.ctx.max_profit_unlock_time
            )));
        }
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        staged.profit_max_unlock_time = profit_max_unlock_time;
        if profit_max_unlock_time == 0 {
            staged.profit_unlock.release_all(self.ctx.clock.now());
        }
        self.commit(
            &mut state,
            staged,
            vec![VaultEvent::UpdatedProfitMaxUnlockTime {
                vault: self.id.clone(),
                profit_max_unlock_time,
            }],
        )
        .await
    }

    // =========================================================================
    // VIEWS
    // =========================================================================

    pub async fn total_assets(&self) -> Amount {
        self.state.lock().await.total_assets(self.ctx.clock.now())
    }

    pub async fn total_idle(&self) -> Amount {
        self.state.lock().await.total_idle
    }

    pub async fn total_debt(&self) -> Amount {
        self.state.lock().await.total_debt
    }

    pub async fn total_supply(&self) -> Amount {
        self.state.lock().await.total_supply
    }

    pub async fn balance_of(&self, holder: &Address) -> Amount {
        self.state.lock().await.balance_of(holder)
    }

    pub async fn convert_to_shares(&self, assets: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.convert_to_shares(assets, self.ctx.clock.now(), Rounding::Down)
    }

    pub async fn convert_to_assets(&self, shares: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.convert_to_assets(shares, self.ctx.clock.now(), Rounding::Down)
    }

    pub async fn preview_deposit(&self, assets: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.preview_deposit(assets, self.ctx.clock.now())
    }

    pub async fn preview_mint(&self, shares: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.preview_mint(shares, self.ctx.clock.now())
    }

    pub async fn preview_withdraw(&self, assets: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.preview_withdraw(assets, self.ctx.clock.now())
    }

    pub async fn preview_redeem(&self, shares: Amount) -> VaultResult<Amount> {
        let state = self.state.lock().await;
        state.preview_redeem(shares, self.ctx.clock.now())
    }

    pub async fn strategies(&self, strategy: &Address) -> Option<StrategyRecord> {
        self.state.lock().await.strategy(strategy).copied()
    }

    pub async fn get_default_queue(&self) -> Vec<Address> {
        self.state.lock().await.default_queue.as_slice().to_vec()
    }

    pub async fn locked_profit(&self) -> Amount {
        self.state.lock().await.locked_profit(self.ctx.clock.now())
    }

    pub async fn profit_unlocking_rate(&self) -> Amount {
        let state = self.state.lock().await;
        state
            .profit_unlock
            .profit_unlocking_rate(self.ctx.clock.now())
    }

    pub async fn full_profit_unlock_date(&self) -> Timestamp {
        self.state.lock().await.profit_unlock.full_profit_unlock_date
    }

    pub async fn profit_max_unlock_time(&self) -> u64 {
        self.state.lock().await.profit_max_unlock_time
    }

    pub async fn snapshot(&self) -> VaultSnapshot {
        let state = self.state.lock().await;
        let now = self.ctx.clock.now();
        VaultSnapshot {
            vault: self.id.clone(),
            index: self.index,
            asset: self.params.asset.clone(),
            agent_name: self.params.agent_name.clone(),
            name: self.params.token_name.clone(),
            symbol: self.params.token_symbol.clone(),
            governance: self.governance.clone(),
            total_assets: state.total_assets(now),
            total_idle: state.total_idle,
            total_debt: state.total_debt,
            total_supply: state.total_supply,
            locked_profit: state.locked_profit(now),
            profit_unlocking_rate: state.profit_unlock.profit_unlocking_rate(now),
            full_profit_unlock_date: state.profit_unlock.full_profit_unlock_date,
            profit_max_unlock_time: state.profit_max_unlock_time,
            default_queue: state.default_queue.as_slice().to_vec(),
            ts: now,
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().await
    }

    fn ensure_governance(&self, caller: &Address) -> VaultResult<()> {
        if caller != &self.governance {
            return Err(VaultError::Unauthorized {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    fn adapter(&self, strategy: &Address) -> VaultResult<Arc<dyn Strategy>> {
        self.ctx
            .strategies
            .get(strategy)
            .ok_or_else(|| VaultError::invalid_strategy(strategy, "no adapter registered"))
    }

    fn queue_event(&self, queue: &DefaultQueue) -> VaultEvent {
        VaultEvent::QueueUpdated {
            vault: self.id.clone(),
            queue: queue.as_slice().to_vec(),
        }
    }

    async fn save(&self, state: &VaultState, dirty: &DirtyRows) -> VaultResult<()> {
        self.ctx
            .db
            .save_vault(
                VaultWrite {
                    vault_id: &self.id,
                    state,
                    dirty,
                },
                self.ctx.clock.now(),
            )
            .await?;
        Ok(())
    }

    async fn persist(&self, staged: &mut VaultState) -> VaultResult<()> {
        let dirty = staged.take_dirty();
        self.save(staged, &dirty).await
    }

    async fn commit(
        &self,
        state: &mut VaultState,
        mut staged: VaultState,
        events: Vec<VaultEvent>,
    ) -> VaultResult<()> {
        self.persist(&mut staged).await?;
        *state = staged;
        self.emit(events).await;
        Ok(())
    }

    pub(crate) async fn emit(&self, events: Vec<VaultEvent>) {
        emit_events(&self.ctx, events).await;
    }
}

/// Record events in the activity log and fan them out to subscribers. The
/// ledger change they describe is already committed, so a log failure is
/// only reported.
pub(crate) async fn emit_events(ctx: &VaultContext, events: Vec<VaultEvent>) {
    let ts = ctx.clock.now();
    for event in events {
        let record = VaultActivityRecord::from_event(&event, ts);
        if let Err(e) = ctx.db.insert_activity(&record).await {
            warn!("Failed to record {} activity: {:#}", record.kind, e);
        }
        ctx.events.publish(event);
    }
}

/// Register `strategy` on a staged ledger. Used both by `add_strategy` and by
/// the factory when seeding a new vault. Returns the events to emit once the
/// ledger is committed.
pub(crate) fn stage_strategy(
    staged: &mut VaultState,
    registry: &StrategyRegistry,
    vault_id: &Address,
    asset: &Address,
    init: &InitialStrategy,
    now: Timestamp,
) -> VaultResult<Vec<VaultEvent>> {
    let strategy = &init.strategy;
    if strategy.is_zero() {
        return Err(VaultError::invalid_strategy(strategy, "null strategy"));
    }
    if staged.strategy(strategy).is_some_and(|r| r.is_active()) {
        return Err(VaultError::invalid_strategy(strategy, "already active"));
    }
    let adapter = registry
        .get(strategy)
        .ok_or_else(|| VaultError::invalid_strategy(strategy, "no adapter registered"))?;
    if adapter.asset() != asset {
        return Err(VaultError::invalid_strategy(
            strategy,
            format!("accounts in {}, vault asset is {}", adapter.asset(), asset),
        ));
    }

    staged.strategies.insert(
        strategy.clone(),
        StrategyRecord {
            // zero would read as inactive
            activation: now.max(1),
            current_debt: 0,
            max_debt: init.max_debt,
            last_report: now,
        },
    );
    let mut events = vec![VaultEvent::StrategyAdded {
        vault: vault_id.clone(),
        strategy: strategy.clone(),
        add_to_queue: init.add_to_queue,
    }];
    if init.max_debt > 0 {
        events.push(VaultEvent::UpdatedMaxDebt {
            vault: vault_id.clone(),
            strategy: strategy.clone(),
            new_max_debt: init.max_debt,
        });
    }
    if init.add_to_queue && staged.default_queue.push_unique(strategy) {
        events.push(VaultEvent::QueueUpdated {
            vault: vault_id.clone(),
            queue: staged.default_queue.as_slice().to_vec(),
        });
    }
    Ok(events)
}

fn ensure_account(account: &Address, role: &str) -> VaultResult<()> {
    if account.is_zero() {
        return Err(VaultError::invalid_params(format!(
            "{} is the null address",
            role
        )));
    }
    Ok(())
}

/// Read-only allowance and balance checks ahead of any liquidity pull.
pub(crate) fn check_share_access(
    state: &VaultState,
    caller: &Address,
    owner: &Address,
    shares: Amount,
) -> VaultResult<()> {
    if caller != owner && state.allowance(owner, caller) < shares {
        return Err(VaultError::Unauthorized {
            caller: caller.clone(),
        });
    }
    let balance = state.balance_of(owner);
    if balance < shares {
        return Err(VaultError::InsufficientShares {
            owner: owner.clone(),
            requested: shares,
            balance,
        });
    }
    Ok(())
}
