//! Vault and factory signals
//!
//! Each committed operation produces one or more [`VaultEvent`]s. They are
//! fanned out on a broadcast channel for live subscribers and appended to the
//! durable activity log.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::vault::math::Amount;
use crate::vault::types::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultEvent {
    VaultCreated {
        vault: Address,
        index: u64,
        asset: Address,
        agent_name: String,
    },
    Deposit {
        vault: Address,
        sender: Address,
        owner: Address,
        assets: Amount,
        shares: Amount,
    },
    Withdraw {
        vault: Address,
        sender: Address,
        receiver: Address,
        owner: Address,
        assets: Amount,
        shares: Amount,
    },
    Approval {
        vault: Address,
        owner: Address,
        spender: Address,
        shares: Amount,
    },
    StrategyAdded {
        vault: Address,
        strategy: Address,
        add_to_queue: bool,
    },
    StrategyRevoked {
        vault: Address,
        strategy: Address,
    },
    UpdatedMaxDebt {
        vault: Address,
        strategy: Address,
        new_max_debt: Amount,
    },
    DebtUpdated {
        vault: Address,
        strategy: Address,
        current_debt: Amount,
        new_debt: Amount,
    },
    StrategyReported {
        vault: Address,
        strategy: Address,
        gain: Amount,
        loss: Amount,
        current_debt: Amount,
        locked_profit: Amount,
        full_profit_unlock_date: Timestamp,
    },
    QueueUpdated {
        vault: Address,
        queue: Vec<Address>,
    },
    UpdatedProfitMaxUnlockTime {
        vault: Address,
        profit_max_unlock_time: u64,
    },
    VaultsRebalanced {
        source_vault: Address,
        dest_vault: Address,
        owner: Address,
        amount: Amount,
    },
}

impl VaultEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VaultCreated { .. } => "VAULT_CREATED",
            Self::Deposit { .. } => "DEPOSIT",
            Self::Withdraw { .. } => "WITHDRAW",
            Self::Approval { .. } => "APPROVAL",
            Self::StrategyAdded { .. } => "STRATEGY_ADDED",
            Self::StrategyRevoked { .. } => "STRATEGY_REVOKED",
            Self::UpdatedMaxDebt { .. } => "UPDATED_MAX_DEBT",
            Self::DebtUpdated { .. } => "DEBT_UPDATED",
            Self::StrategyReported { .. } => "STRATEGY_REPORTED",
            Self::QueueUpdated { .. } => "QUEUE_UPDATED",
            Self::UpdatedProfitMaxUnlockTime { .. } => "UPDATED_PROFIT_MAX_UNLOCK_TIME",
            Self::VaultsRebalanced { .. } => "VAULTS_REBALANCED",
        }
    }

    /// Vault the event is filed under. Cross-vault moves file under the source.
    pub fn vault(&self) -> &Address {
        match self {
            Self::VaultCreated { vault, .. }
            | Self::Deposit { vault, .. }
            | Self::Withdraw { vault, .. }
            | Self::Approval { vault, .. }
            | Self::StrategyAdded { vault, .. }
            | Self::StrategyRevoked { vault, .. }
            | Self::UpdatedMaxDebt { vault, .. }
            | Self::DebtUpdated { vault, .. }
            | Self::StrategyReported { vault, .. }
            | Self::QueueUpdated { vault, .. }
            | Self::UpdatedProfitMaxUnlockTime { vault, .. } => vault,
            Self::VaultsRebalanced { source_vault, .. } => source_vault,
        }
    }
}

/// Durable row for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultActivityRecord {
    pub id: String,
    pub ts: Timestamp,
    pub vault: String,
    pub kind: String,
    pub payload: String,
}

impl VaultActivityRecord {
    pub fn from_event(event: &VaultEvent, ts: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts,
            vault: event.vault().to_string(),
            kind: event.kind().to_string(),
            payload: serde_json::to_string(event).unwrap_or_default(),
        }
    }

    pub fn event(&self) -> Option<VaultEvent> {
        serde_json::from_str(&self.payload).ok()
    }
}

/// Broadcast side of the event stream, shared by the factory and its vaults.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: VaultEvent) {
        if self.tx.send(event).is_err() {
            debug!("vault event dropped: no subscribers");
        }
    }
}
