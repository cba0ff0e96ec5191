//! Cross-vault rebalance
//!
//! Moves a depositor's position from one vault to another vault of the same
//! asset as a single unit of work. Both vault locks are taken in creation
//! order, both ledgers are staged, the asset moves custody in one transfer,
//! and both ledgers are written in one store transaction. Nothing becomes
//! visible until all of that has succeeded.

use tracing::{error, info};

use crate::clock::Timestamp;
use crate::factory::VaultFactory;
use crate::vault::pool::{check_share_access, emit_events};
use crate::vault::{
    Address, Amount, VaultError, VaultEvent, VaultResult, VaultState, VaultWrite,
};

impl VaultFactory {
    /// Redeem `caller`'s shares in `source` and deposit the proceeds into
    /// `dest` for the same caller. A `target_amount` of zero moves the whole
    /// position. Returns the asset amount moved.
    pub async fn rebalance_between_vaults(
        &self,
        caller: &Address,
        source: &Address,
        dest: &Address,
        target_amount: Amount,
    ) -> VaultResult<Amount> {
        if source == dest {
            return Err(VaultError::SameVault {
                vault: source.clone(),
            });
        }
        let src = self.vault(source)?;
        let dst = self.vault(dest)?;
        if src.asset() != dst.asset() {
            return Err(VaultError::AssetMismatch {
                source_asset: src.asset().clone(),
                dest_asset: dst.asset().clone(),
            });
        }

        // Fixed lock order keeps opposite-direction moves from deadlocking
        let (mut src_state, mut dst_state) = if src.index() < dst.index() {
            let s = src.lock_state().await;
            let d = dst.lock_state().await;
            (s, d)
        } else {
            let d = dst.lock_state().await;
            let s = src.lock_state().await;
            (s, d)
        };

        let now = self.ctx.clock.now();
        let (shares, amount) = size_move(&src_state, caller, target_amount, now)?;
        src.ensure_liquidity(&mut src_state, amount).await?;
        if amount == 0 {
            return Err(VaultError::invalid_amount("position is worth zero assets"));
        }

        let dest_shares = dst_state.preview_deposit(amount, now)?;
        if dest_shares == 0 {
            return Err(VaultError::invalid_amount(
                "destination deposit rounds to zero shares",
            ));
        }

        let mut src_staged = src_state.clone();
        src_staged.burn(caller, shares)?;
        if src_staged.total_idle < amount {
            return Err(VaultError::InsufficientLiquidity {
                requested: amount,
                available: src_staged.total_idle,
            });
        }
        src_staged.total_idle -= amount;

        let mut dst_staged = dst_state.clone();
        dst_staged.mint(caller, dest_shares)?;
        dst_staged.total_idle = dst_staged
            .total_idle
            .checked_add(amount)
            .ok_or_else(|| VaultError::invalid_amount("idle balance overflow"))?;

        self.ctx
            .assets
            .transfer(src.asset(), src.id(), dst.id(), amount)
            .await
            .map_err(|e| VaultError::TransferFailed { reason: e.reason })?;

        let src_dirty = src_staged.take_dirty();
        let dst_dirty = dst_staged.take_dirty();
        let saved = self
            .ctx
            .db
            .save_vaults(
                &[
                    VaultWrite {
                        vault_id: src.id(),
                        state: &src_staged,
                        dirty: &src_dirty,
                    },
                    VaultWrite {
                        vault_id: dst.id(),
                        state: &dst_staged,
                        dirty: &dst_dirty,
                    },
                ],
                now,
            )
            .await;
        if let Err(e) = saved {
            if let Err(undo) = self
                .ctx
                .assets
                .transfer(src.asset(), dst.id(), src.id(), amount)
                .await
            {
                error!(
                    "Could not return {} from {} to {} after failed commit: {}",
                    amount,
                    dst.id(),
                    src.id(),
                    undo
                );
            }
            return Err(e.into());
        }

        *src_state = src_staged;
        *dst_state = dst_staged;
        drop(dst_state);
        drop(src_state);

        info!(
            "Rebalanced {} assets for {}: {} ({} shares) -> {} ({} shares)",
            amount,
            caller,
            source,
            shares,
            dest,
            dest_shares
        );
        emit_events(
            &self.ctx,
            vec![
                VaultEvent::Withdraw {
                    vault: source.clone(),
                    sender: caller.clone(),
                    receiver: dest.clone(),
                    owner: caller.clone(),
                    assets: amount,
                    shares,
                },
                VaultEvent::Deposit {
                    vault: dest.clone(),
                    sender: caller.clone(),
                    owner: caller.clone(),
                    assets: amount,
                    shares: dest_shares,
                },
                VaultEvent::VaultsRebalanced {
                    source_vault: source.clone(),
                    dest_vault: dest.clone(),
                    owner: caller.clone(),
                    amount,
                },
            ],
        )
        .await;
        Ok(amount)
    }
}

/// Shares to burn and assets to move. Zero target means the whole balance.
fn size_move(
    state: &VaultState,
    owner: &Address,
    target_amount: Amount,
    now: Timestamp,
) -> VaultResult<(Amount, Amount)> {
    let (shares, amount) = if target_amount == 0 {
        let shares = state.balance_of(owner);
        if shares == 0 {
            return Err(VaultError::InsufficientShares {
                owner: owner.clone(),
                requested: 0,
                balance: 0,
            });
        }
        (shares, state.preview_redeem(shares, now)?)
    } else {
        (state.preview_withdraw(target_amount, now)?, target_amount)
    };
    check_share_access(state, owner, owner, shares)?;
    Ok((shares, amount))
}
