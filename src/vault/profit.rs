//! Linear profit unlocking
//!
//! Reported gains are withheld from `total_assets()` and released linearly
//! until `full_profit_unlock_date`. A new gain reported while an earlier one
//! is still unlocking is merged: the remaining locked amount plus the new
//! gain is re-spread over a fresh window starting now.
//!
//! Locked profit is stored as the amount locked at the last update together
//! with the window bounds, so the locked amount equals the reported gain
//! exactly at report time (no rate truncation) and reaches zero exactly at
//! the unlock date. The per-second rate is derived for reporting only.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::vault::math::{mul_div, Amount, Rounding, UNLOCK_RATE_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockPhase {
    Idle,
    Unlocking,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitUnlock {
    /// Profit still locked as of `last_update`
    pub locked_at_update: Amount,
    pub last_update: Timestamp,
    pub full_profit_unlock_date: Timestamp,
}

impl ProfitUnlock {
    /// Profit still withheld from the exchange rate at `now`.
    ///
    /// Rounds up, so profit is never released ahead of schedule.
    pub fn locked(&self, now: Timestamp) -> Amount {
        if self.locked_at_update == 0 || now >= self.full_profit_unlock_date {
            return 0;
        }
        let now = now.max(self.last_update);
        let window = (self.full_profit_unlock_date - self.last_update) as u128;
        let remaining = (self.full_profit_unlock_date - now) as u128;
        mul_div(self.locked_at_update, remaining, window, Rounding::Up)
            .unwrap_or(self.locked_at_update)
            .min(self.locked_at_update)
    }

    pub fn phase(&self, now: Timestamp) -> UnlockPhase {
        if self.locked(now) > 0 {
            UnlockPhase::Unlocking
        } else {
            UnlockPhase::Idle
        }
    }

    /// Unlock speed in base units per second, scaled by `UNLOCK_RATE_SCALE`.
    pub fn profit_unlocking_rate(&self, now: Timestamp) -> Amount {
        if self.phase(now) == UnlockPhase::Idle {
            return 0;
        }
        let window = (self.full_profit_unlock_date - self.last_update) as u128;
        mul_div(self.locked_at_update, UNLOCK_RATE_SCALE, window, Rounding::Down).unwrap_or(0)
    }

    /// Lock a freshly reported gain. With a zero window the gain, and anything
    /// still unlocking, is released immediately.
    pub fn lock_gain(&mut self, gain: Amount, now: Timestamp, profit_max_unlock_time: u64) {
        if profit_max_unlock_time == 0 {
            self.release_all(now);
            return;
        }
        let remaining = self.locked(now);
        let new_locked = remaining.saturating_add(gain);
        if new_locked == 0 {
            return;
        }
        self.locked_at_update = new_locked;
        self.last_update = now;
        self.full_profit_unlock_date = now.saturating_add(profit_max_unlock_time as i64);
    }

    /// Drop any remaining lock.
    pub fn release_all(&mut self, now: Timestamp) {
        self.locked_at_update = 0;
        self.last_update = now;
        self.full_profit_unlock_date = now;
    }
}
