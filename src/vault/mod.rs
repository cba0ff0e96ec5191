//! Vault Module - Share Accounting & Strategy Debt
//!
//! This module handles:
//! 1. Depositor shares priced against idle funds plus strategy debt
//! 2. Linear vesting of reported strategy profit
//! 3. Governance-driven allocation of idle funds to strategies
//!
//! Architecture:
//! - `state` holds the pure ledger, `pool` wraps it with locking, transfers,
//!   strategy calls and persistence
//! - `vault_db` is the SQLite store for every vault and the factory registry

pub mod error;
pub mod events;
pub mod math;
pub mod pool;
pub mod profit;
pub mod queue;
pub mod state;
pub mod types;
pub mod vault_db;

pub use error::{VaultError, VaultResult};
pub use events::{EventBus, VaultActivityRecord, VaultEvent};
pub use math::{mul_div, Amount, Rounding, UNLOCK_RATE_SCALE};
pub use pool::{Vault, VaultContext, VaultSnapshot};
pub use profit::{ProfitUnlock, UnlockPhase};
pub use queue::DefaultQueue;
pub use state::VaultState;
pub use types::{Address, InitialStrategy, StrategyRecord, VaultParams};
pub use vault_db::{FactoryMeta, StoredVault, VaultDb, VaultWrite};
