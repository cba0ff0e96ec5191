//! Vault and factory error taxonomy
//!
//! Every variant is a synchronous, caller-visible failure. Operations that
//! return one of these leave the share ledger, the strategy ledger and the
//! registry exactly as they were before the call.

use crate::vault::math::Amount;
use crate::vault::types::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Zero or otherwise unusable quantity where a positive one is required
    InvalidAmount { reason: String },
    /// Null, duplicate, unknown or wrong-asset strategy identifier
    InvalidStrategy { strategy: Address, reason: String },
    /// Ledger operation on a strategy that is not active
    InactiveStrategy { strategy: Address },
    /// Revoke attempted while the strategy still holds debt
    StrategyHasDebt { strategy: Address, current_debt: Amount },
    /// Governance operation targeted at an unregistered vault
    NotAVault { vault: Address },
    /// Cross-vault rebalance with identical source and destination
    SameVault { vault: Address },
    /// Cross-vault rebalance between vaults of different assets
    AssetMismatch {
        source_asset: Address,
        dest_asset: Address,
    },
    /// No room under the strategy's ceiling to increase its allocation
    DebtCeilingExceeded {
        strategy: Address,
        current_debt: Amount,
        max_debt: Amount,
    },
    /// Strategy returned less than the caller's minimum
    SlippageExceeded {
        strategy: Address,
        returned: Amount,
        min_out: Amount,
    },
    /// Idle funds plus the withdrawal queue cannot cover the request
    InsufficientLiquidity { requested: Amount, available: Amount },
    /// Owner holds fewer shares than the operation burns
    InsufficientShares {
        owner: Address,
        requested: Amount,
        balance: Amount,
    },
    /// Underlying asset movement failed
    TransferFailed { reason: String },
    /// Caller is not the authorised principal
    Unauthorized { caller: Address },
    /// Malformed creation or configuration parameters
    InvalidParams { reason: String },
    /// A strategy adapter call returned an error
    StrategyFailed { strategy: Address, reason: String },
    /// Durable store failure
    Storage { reason: String },
}

impl VaultError {
    pub fn invalid_amount(reason: impl Into<String>) -> Self {
        Self::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub fn invalid_strategy(strategy: &Address, reason: impl Into<String>) -> Self {
        Self::InvalidStrategy {
            strategy: strategy.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    pub fn strategy_failed(strategy: &Address, err: anyhow::Error) -> Self {
        Self::StrategyFailed {
            strategy: strategy.clone(),
            reason: format!("{:#}", err),
        }
    }

    /// Stable short name, used for activity logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "InvalidAmount",
            Self::InvalidStrategy { .. } => "InvalidStrategy",
            Self::InactiveStrategy { .. } => "InactiveStrategy",
            Self::StrategyHasDebt { .. } => "StrategyHasDebt",
            Self::NotAVault { .. } => "NotAVault",
            Self::SameVault { .. } => "SameVault",
            Self::AssetMismatch { .. } => "AssetMismatch",
            Self::DebtCeilingExceeded { .. } => "DebtCeilingExceeded",
            Self::SlippageExceeded { .. } => "SlippageExceeded",
            Self::InsufficientLiquidity { .. } => "InsufficientLiquidity",
            Self::InsufficientShares { .. } => "InsufficientShares",
            Self::TransferFailed { .. } => "TransferFailed",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::InvalidParams { .. } => "InvalidParams",
            Self::StrategyFailed { .. } => "StrategyFailed",
            Self::Storage { .. } => "Storage",
        }
    }
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAmount { reason } => write!(f, "Invalid amount: {}", reason),
            Self::InvalidStrategy { strategy, reason } => {
                write!(f, "Invalid strategy {}: {}", strategy, reason)
            }
            Self::InactiveStrategy { strategy } => {
                write!(f, "Strategy {} is not active", strategy)
            }
            Self::StrategyHasDebt {
                strategy,
                current_debt,
            } => write!(
                f,
                "Strategy {} still holds debt {}",
                strategy, current_debt
            ),
            Self::NotAVault { vault } => write!(f, "Not a valid vault: {}", vault),
            Self::SameVault { vault } => write!(f, "Same vault: {}", vault),
            Self::AssetMismatch {
                source_asset,
                dest_asset,
            } => write!(
                f,
                "Different assets: source {} vs destination {}",
                source_asset, dest_asset
            ),
            Self::DebtCeilingExceeded {
                strategy,
                current_debt,
                max_debt,
            } => write!(
                f,
                "Debt ceiling reached for {}: current {} >= max {}",
                strategy, current_debt, max_debt
            ),
            Self::SlippageExceeded {
                strategy,
                returned,
                min_out,
            } => write!(
                f,
                "Strategy {} returned {} < min_out {}",
                strategy, returned, min_out
            ),
            Self::InsufficientLiquidity {
                requested,
                available,
            } => write!(
                f,
                "Insufficient liquidity: requested {}, available {}",
                requested, available
            ),
            Self::InsufficientShares {
                owner,
                requested,
                balance,
            } => write!(
                f,
                "Insufficient shares for {}: requested {}, balance {}",
                owner, requested, balance
            ),
            Self::TransferFailed { reason } => write!(f, "Transfer failed: {}", reason),
            Self::Unauthorized { caller } => write!(f, "Unauthorized caller: {}", caller),
            Self::InvalidParams { reason } => write!(f, "Invalid params: {}", reason),
            Self::StrategyFailed { strategy, reason } => {
                write!(f, "Strategy {} call failed: {}", strategy, reason)
            }
            Self::Storage { reason } => write!(f, "Storage error: {}", reason),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<anyhow::Error> for VaultError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage {
            reason: format!("{:#}", err),
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
