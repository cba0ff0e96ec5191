use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::vault::math::Amount;

/// Account, asset, strategy or vault identifier.
///
/// Normalised to trimmed lowercase, the same way wallet addresses are keyed
/// in the share ledger. Empty or all-zero hex is the null identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub const ZERO_HEX: &'static str = "0x0000000000000000000000000000000000000000";

    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn zero() -> Self {
        Self(Self::ZERO_HEX.to_string())
    }

    /// Fresh random identifier, formatted like a 20-byte hex address.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("0x{}{}", &hex, &hex[..8]))
    }

    pub fn is_zero(&self) -> bool {
        let digits = self.0.strip_prefix("0x").unwrap_or(&self.0);
        digits.chars().all(|c| c == '0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Per-vault ledger entry for one strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRecord {
    /// Activation time; zero means inactive
    pub activation: Timestamp,
    pub current_debt: Amount,
    pub max_debt: Amount,
    pub last_report: Timestamp,
}

impl StrategyRecord {
    pub fn is_active(&self) -> bool {
        self.activation != 0
    }

    /// Room left under the debt ceiling.
    pub fn headroom(&self) -> Amount {
        self.max_debt.saturating_sub(self.current_debt)
    }
}

/// Strategy to register while creating a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialStrategy {
    pub strategy: Address,
    #[serde(default)]
    pub max_debt: Amount,
    #[serde(default = "default_add_to_queue")]
    pub add_to_queue: bool,
}

fn default_add_to_queue() -> bool {
    true
}

/// Creation parameters, recorded immutably per vault by the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    /// Opaque pool / agent label
    pub agent_name: String,
    pub asset: Address,
    pub token_name: String,
    pub token_symbol: String,
    pub profit_max_unlock_time: u64,
    /// Defaults to the factory owner when absent
    #[serde(default)]
    pub governance: Option<Address>,
    #[serde(default)]
    pub initial_strategies: Vec<InitialStrategy>,
}

impl VaultParams {
    pub fn new(agent_name: &str, asset: Address, profit_max_unlock_time: u64) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            asset,
            token_name: format!("{} Vault", agent_name),
            token_symbol: format!("yv{}", agent_name),
            profit_max_unlock_time,
            governance: None,
            initial_strategies: Vec::new(),
        }
    }

    pub fn with_governance(mut self, governance: Address) -> Self {
        self.governance = Some(governance);
        self
    }

    pub fn with_strategy(mut self, strategy: Address, max_debt: Amount, add_to_queue: bool) -> Self {
        self.initial_strategies.push(InitialStrategy {
            strategy,
            max_debt,
            add_to_queue,
        });
        self
    }
}
