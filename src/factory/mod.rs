//! Vault factory
//!
//! Creates vaults, keeps the append-only registry, and dispatches governance
//! calls to registered vaults. The factory holds no ledger state of its own:
//! every pass-through checks registry membership and then forwards the
//! caller, and each vault enforces its own governance principal.

pub mod rebalance;

use futures_util::future::join_all;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::assets::AssetTransfer;
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::strategy::{StrategyRegistry, StrategyReport};
use crate::vault::pool::{emit_events, stage_strategy};
use crate::vault::{
    Address, Amount, EventBus, FactoryMeta, StoredVault, Vault, VaultActivityRecord,
    VaultContext, VaultDb, VaultError, VaultEvent, VaultParams, VaultResult, VaultSnapshot,
    VaultState,
};

#[derive(Default)]
struct Registry {
    vaults: Vec<Arc<Vault>>,
    by_id: HashMap<Address, usize>,
}

pub struct VaultFactory {
    owner: Address,
    vault_implementation: String,
    config: VaultConfig,
    ctx: VaultContext,
    registry: RwLock<Registry>,
    /// Serialises creation so registry indices are assigned in order
    create_lock: Mutex<()>,
}

impl VaultFactory {
    /// Open the store at `config.database_path` and restore every vault.
    pub async fn open(
        config: VaultConfig,
        owner: Address,
        assets: Arc<dyn AssetTransfer>,
        strategies: Arc<StrategyRegistry>,
        clock: Arc<dyn Clock>,
    ) -> VaultResult<Self> {
        let db = VaultDb::new(&config.database_path)?;
        Self::open_with_db(db, config, owner, assets, strategies, clock).await
    }

    pub async fn open_with_db(
        db: VaultDb,
        config: VaultConfig,
        owner: Address,
        assets: Arc<dyn AssetTransfer>,
        strategies: Arc<StrategyRegistry>,
        clock: Arc<dyn Clock>,
    ) -> VaultResult<Self> {
        if owner.is_zero() {
            return Err(VaultError::invalid_params("factory owner is the null address"));
        }

        let vault_implementation = match db.load_factory_meta().await? {
            Some(meta) if meta.owner != owner => {
                return Err(VaultError::Unauthorized { caller: owner });
            }
            Some(meta) => meta.vault_implementation,
            None => {
                let meta = FactoryMeta {
                    owner: owner.clone(),
                    vault_implementation: config.vault_implementation.clone(),
                };
                db.upsert_factory_meta(&meta, clock.now()).await?;
                meta.vault_implementation
            }
        };

        let ctx = VaultContext {
            db: db.clone(),
            assets,
            strategies,
            clock,
            events: EventBus::new(config.event_channel_capacity),
            max_profit_unlock_time: config.max_profit_unlock_time,
        };

        let mut registry = Registry::default();
        for stored in db.load_registry().await? {
            let state = db
                .load_vault_state(&stored.vault_id)
                .await?
                .ok_or_else(|| VaultError::Storage {
                    reason: format!("vault {} has no stored ledger", stored.vault_id),
                })?;
            let position = registry.vaults.len();
            registry.by_id.insert(stored.vault_id.clone(), position);
            registry
                .vaults
                .push(Arc::new(Vault::new(stored, state, ctx.clone())));
        }
        info!(
            "Vault factory ready: owner={} implementation={} vaults={}",
            owner,
            vault_implementation,
            registry.vaults.len()
        );

        Ok(Self {
            owner,
            vault_implementation,
            config,
            ctx,
            registry: RwLock::new(registry),
            create_lock: Mutex::new(()),
        })
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    /// Template label new vaults are instantiated from.
    pub fn vault_implementation(&self) -> &str {
        &self.vault_implementation
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.ctx.events.subscribe()
    }

    // =========================================================================
    // CREATION
    // =========================================================================

    /// Deploy a new vault. Owner only.
    pub async fn create_vault(&self, caller: &Address, params: VaultParams) -> VaultResult<Address> {
        if caller != &self.owner {
            return Err(VaultError::Unauthorized {
                caller: caller.clone(),
            });
        }
        if params.asset.is_zero() {
            return Err(VaultError::invalid_params("asset is the null address"));
        }
        let mut params = params;
        params.profit_max_unlock_time = self
            .config
            .resolve_unlock_time(params.profit_max_unlock_time);
        if params.profit_max_unlock_time > self.config.max_profit_unlock_time {
            return Err(VaultError::invalid_params(format!(
                "profit_max_unlock_time {} above maximum {}",
                params.profit_max_unlock_time, self.config.max_profit_unlock_time
            )));
        }
        if let Some(governance) = &params.governance {
            if governance.is_zero() {
                return Err(VaultError::invalid_params("governance is the null address"));
            }
        }
        let mut seen = HashSet::new();
        for initial in &params.initial_strategies {
            if !seen.insert(&initial.strategy) {
                return Err(VaultError::invalid_strategy(
                    &initial.strategy,
                    "duplicate initial strategy",
                ));
            }
        }

        let _guard = self.create_lock.lock().await;
        let now = self.ctx.clock.now();
        let index = self.registry.read().vaults.len() as u64;
        let vault_id = Address::generate();
        let governance = params
            .governance
            .clone()
            .unwrap_or_else(|| self.owner.clone());

        let mut state = VaultState::new(params.profit_max_unlock_time);
        let mut events = vec![VaultEvent::VaultCreated {
            vault: vault_id.clone(),
            index,
            asset: params.asset.clone(),
            agent_name: params.agent_name.clone(),
        }];
        for initial in &params.initial_strategies {
            events.extend(stage_strategy(
                &mut state,
                &self.ctx.strategies,
                &vault_id,
                &params.asset,
                initial,
                now,
            )?);
        }

        let record = StoredVault {
            index,
            vault_id: vault_id.clone(),
            governance,
            params,
            created_at: now,
        };
        let dirty = state.take_dirty();
        self.ctx.db.insert_vault(&record, &state, &dirty).await?;

        let vault = Arc::new(Vault::new(record, state, self.ctx.clone()));
        {
            let mut registry = self.registry.write();
            let position = registry.vaults.len();
            registry.by_id.insert(vault_id.clone(), position);
            registry.vaults.push(vault.clone());
        }
        info!(
            "Created vault #{} {} for {} ({}), governance={}",
            index,
            vault_id,
            vault.asset(),
            vault.params().agent_name,
            vault.governance()
        );
        emit_events(&self.ctx, events).await;
        Ok(vault_id)
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    pub fn list_all_vaults(&self) -> Vec<Address> {
        self.registry
            .read()
            .vaults
            .iter()
            .map(|v| v.id().clone())
            .collect()
    }

    pub fn list_all_vaults_with_params(&self) -> Vec<(Address, VaultParams)> {
        self.registry
            .read()
            .vaults
            .iter()
            .map(|v| (v.id().clone(), v.params().clone()))
            .collect()
    }

    /// Current view of every vault, in creation order.
    pub async fn snapshots(&self) -> Vec<VaultSnapshot> {
        let vaults = self.registry.read().vaults.clone();
        join_all(vaults.iter().map(|v| v.snapshot())).await
    }

    pub fn is_vault(&self, vault: &Address) -> bool {
        self.registry.read().by_id.contains_key(vault)
    }

    /// Creation parameters of the vault at `index`.
    pub fn get_vault(&self, index: u64) -> Option<VaultParams> {
        self.vault_at(index).map(|v| v.params().clone())
    }

    /// Identifier of the vault at `index`.
    pub fn all_vaults(&self, index: u64) -> Option<Address> {
        self.vault_at(index).map(|v| v.id().clone())
    }

    pub fn vault_count(&self) -> usize {
        self.registry.read().vaults.len()
    }

    /// Handle for depositor-facing calls on a registered vault.
    pub fn vault(&self, vault: &Address) -> VaultResult<Arc<Vault>> {
        let registry = self.registry.read();
        registry
            .by_id
            .get(vault)
            .and_then(|i| registry.vaults.get(*i))
            .cloned()
            .ok_or_else(|| VaultError::NotAVault {
                vault: vault.clone(),
            })
    }

    fn vault_at(&self, index: u64) -> Option<Arc<Vault>> {
        let index = usize::try_from(index).ok()?;
        self.registry.read().vaults.get(index).cloned()
    }

    /// Most recent activity, optionally for one vault.
    pub async fn list_activity(
        &self,
        limit: usize,
        vault: Option<&Address>,
    ) -> VaultResult<Vec<VaultActivityRecord>> {
        Ok(self.ctx.db.list_activity(limit, vault).await?)
    }

    // =========================================================================
    // GOVERNANCE PASS-THROUGHS
    // =========================================================================

    pub async fn add_strategy(
        &self,
        caller: &Address,
        vault: &Address,
        strategy: &Address,
        add_to_queue: bool,
    ) -> VaultResult<()> {
        self.vault(vault)?
            .add_strategy(caller, strategy, add_to_queue)
            .await
    }

    pub async fn set_max_debt(
        &self,
        caller: &Address,
        vault: &Address,
        strategy: &Address,
        new_max_debt: Amount,
    ) -> VaultResult<()> {
        self.vault(vault)?
            .set_max_debt(caller, strategy, new_max_debt)
            .await
    }

    pub async fn rebalance_debt(
        &self,
        caller: &Address,
        vault: &Address,
        strategy: &Address,
        target_debt: Amount,
        min_out: Amount,
    ) -> VaultResult<Amount> {
        self.vault(vault)?
            .rebalance_debt(caller, strategy, target_debt, min_out)
            .await
    }

    pub async fn process_report(
        &self,
        caller: &Address,
        vault: &Address,
        strategy: &Address,
    ) -> VaultResult<StrategyReport> {
        self.vault(vault)?.process_report(caller, strategy).await
    }

    pub async fn revoke_strategy(
        &self,
        caller: &Address,
        vault: &Address,
        strategy: &Address,
    ) -> VaultResult<()> {
        self.vault(vault)?.revoke_strategy(caller, strategy).await
    }

    pub async fn set_default_queue(
        &self,
        caller: &Address,
        vault: &Address,
        queue: Vec<Address>,
    ) -> VaultResult<()> {
        self.vault(vault)?.set_default_queue(caller, queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::InMemoryAssetLedger;
    use crate::clock::ManualClock;
    use crate::strategy::MockStrategy;

    async fn factory() -> (VaultFactory, Arc<StrategyRegistry>, Arc<InMemoryAssetLedger>) {
        let ledger = Arc::new(InMemoryAssetLedger::new());
        let registry = Arc::new(StrategyRegistry::new());
        let factory = VaultFactory::open_with_db(
            VaultDb::open_in_memory().unwrap(),
            VaultConfig::default(),
            Address::new("owner"),
            ledger.clone(),
            registry.clone(),
            Arc::new(ManualClock::new(1_000)),
        )
        .await
        .unwrap();
        (factory, registry, ledger)
    }

    fn usdc() -> Address {
        Address::new("0xusdc")
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_indices() {
        let (factory, _, _) = factory().await;
        let owner = Address::new("owner");
        let mut rx = factory.subscribe();

        let a = factory
            .create_vault(&owner, VaultParams::new("PoolA", usdc(), 604_800))
            .await
            .unwrap();
        let b = factory
            .create_vault(&owner, VaultParams::new("PoolB", usdc(), 604_800))
            .await
            .unwrap();

        assert_eq!(factory.list_all_vaults(), vec![a.clone(), b.clone()]);
        assert_eq!(factory.all_vaults(1), Some(b.clone()));
        assert_eq!(factory.get_vault(0).unwrap().agent_name, "PoolA");
        assert!(factory.get_vault(2).is_none());
        assert!(factory.is_vault(&a));
        assert_eq!(factory.vault(&b).unwrap().governance(), &owner);

        let snapshots = factory.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].vault, b);
        assert_eq!(snapshots[1].index, 1);

        match rx.recv().await.unwrap() {
            VaultEvent::VaultCreated { vault, index, .. } => {
                assert_eq!(vault, a);
                assert_eq!(index, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (factory, registry, ledger) = factory().await;
        let owner = Address::new("owner");

        let err = factory
            .create_vault(&Address::new("mallory"), VaultParams::new("P", usdc(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");

        let err = factory
            .create_vault(&owner, VaultParams::new("P", Address::zero(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidParams");

        let err = factory
            .create_vault(&owner, VaultParams::new("P", usdc(), 31_556_953))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidParams");

        let s1 = Address::new("0xs1");
        registry.register(Arc::new(MockStrategy::new(s1.clone(), usdc(), ledger)));
        let params = VaultParams::new("P", usdc(), 0)
            .with_strategy(s1.clone(), 100, true)
            .with_strategy(s1.clone(), 200, false);
        let err = factory.create_vault(&owner, params).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidStrategy");
        assert_eq!(factory.vault_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_strategies_are_registered() {
        let (factory, registry, ledger) = factory().await;
        let owner = Address::new("owner");
        let s1 = Address::new("0xs1");
        registry.register(Arc::new(MockStrategy::new(s1.clone(), usdc(), ledger)));

        let params = VaultParams::new("P", usdc(), 0).with_strategy(s1.clone(), 500, true);
        let id = factory.create_vault(&owner, params).await.unwrap();
        let vault = factory.vault(&id).unwrap();

        assert_eq!(vault.strategies(&s1).await.unwrap().max_debt, 500);
        assert_eq!(vault.get_default_queue().await, vec![s1]);
    }

    #[tokio::test]
    async fn test_pass_throughs_require_registered_vault() {
        let (factory, _, _) = factory().await;
        let owner = Address::new("owner");
        let ghost = Address::new("0xghost");
        let s1 = Address::new("0xs1");

        let err = factory
            .add_strategy(&owner, &ghost, &s1, true)
            .await
            .unwrap_err();
        assert_eq!(err, VaultError::NotAVault { vault: ghost.clone() });
        let err = factory
            .set_max_debt(&owner, &ghost, &s1, 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotAVault");
        let err = factory
            .rebalance_debt(&owner, &ghost, &s1, 1, 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotAVault");
        let err = factory
            .process_report(&owner, &ghost, &s1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotAVault");
    }

    #[tokio::test]
    async fn test_reopen_with_other_owner_refused() {
        let db = VaultDb::open_in_memory().unwrap();
        let ledger = Arc::new(InMemoryAssetLedger::new());
        let registry = Arc::new(StrategyRegistry::new());
        let clock = Arc::new(ManualClock::new(1));

        let first = VaultFactory::open_with_db(
            db.clone(),
            VaultConfig::default(),
            Address::new("owner"),
            ledger.clone(),
            registry.clone(),
            clock.clone(),
        )
        .await
        .unwrap();
        assert_eq!(first.vault_implementation(), "vault-v1");

        let err = VaultFactory::open_with_db(
            db,
            VaultConfig::default(),
            Address::new("mallory"),
            ledger,
            registry,
            clock,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), "Unauthorized");
    }
}
