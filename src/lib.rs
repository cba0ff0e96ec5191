//! Vault Factory Backend Library
//!
//! Multi-vault yield allocation core: per-asset share vaults that lend idle
//! funds to strategy adapters, vest reported profit linearly, and are
//! created, administered and rebalanced through a single factory.

pub mod assets;
pub mod clock;
pub mod config;
pub mod factory;
pub mod strategy;
pub mod vault;

pub use assets::{AssetTransfer, InMemoryAssetLedger, TransferError};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{init_tracing, VaultConfig};
pub use factory::VaultFactory;
pub use strategy::{MockStrategy, Strategy, StrategyRegistry, StrategyReport};
pub use vault::{
    Address, Amount, Vault, VaultError, VaultEvent, VaultParams, VaultResult, VaultSnapshot,
};
