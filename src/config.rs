//! Vault engine configuration
//!
//! Storage location, profit-unlock bounds and event fan-out sizing.
//! Loaded from TOML with environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for any vault's profit unlock window (one year).
pub const MAX_PROFIT_UNLOCK_TIME: u64 = 31_556_952;

/// Seven days, the window used by the reference deployments.
pub const DEFAULT_PROFIT_MAX_UNLOCK_TIME: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// SQLite database holding the vault registry and every vault ledger
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Unlock window applied when creation params leave it at zero and
    /// `zero_unlock_means_default` is set
    #[serde(default = "default_profit_max_unlock_time")]
    pub default_profit_max_unlock_time: u64,

    /// Treat `profit_max_unlock_time == 0` in creation params as "use default"
    /// instead of "unlock instantly"
    #[serde(default)]
    pub zero_unlock_means_default: bool,

    /// Largest unlock window a vault may be created or reconfigured with
    #[serde(default = "default_max_profit_unlock_time")]
    pub max_profit_unlock_time: u64,

    /// Capacity of the broadcast channel carrying vault events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Label recorded as the factory's vault template
    #[serde(default = "default_vault_implementation")]
    pub vault_implementation: String,
}

fn default_database_path() -> String {
    "./vaults.db".to_string()
}

fn default_profit_max_unlock_time() -> u64 {
    DEFAULT_PROFIT_MAX_UNLOCK_TIME
}

fn default_max_profit_unlock_time() -> u64 {
    MAX_PROFIT_UNLOCK_TIME
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_vault_implementation() -> String {
    "vault-v1".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            default_profit_max_unlock_time: default_profit_max_unlock_time(),
            zero_unlock_means_default: false,
            max_profit_unlock_time: default_max_profit_unlock_time(),
            event_channel_capacity: default_event_channel_capacity(),
            vault_implementation: default_vault_implementation(),
        }
    }
}

impl VaultConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `.env`, then the TOML file named by `VAULT_CONFIG_PATH`
    /// (default `vault_config.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();

        let path =
            std::env::var("VAULT_CONFIG_PATH").unwrap_or_else(|_| "vault_config.toml".to_string());

        let mut cfg = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default vault config ({}): {}", path, e);
            Self::default()
        });

        if let Ok(db_path) = std::env::var("VAULT_DB_PATH") {
            if !db_path.trim().is_empty() {
                cfg.database_path = db_path;
            }
        }

        cfg.default_profit_max_unlock_time = std::env::var("VAULT_PROFIT_UNLOCK_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v <= cfg.max_profit_unlock_time)
            .unwrap_or(cfg.default_profit_max_unlock_time);

        cfg.event_channel_capacity = std::env::var("VAULT_EVENT_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.event_channel_capacity);

        cfg
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Resolve the unlock window a new vault is created with.
    pub fn resolve_unlock_time(&self, requested: u64) -> u64 {
        if requested == 0 && self.zero_unlock_means_default {
            self.default_profit_max_unlock_time
        } else {
            requested
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultfactory_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
