//! End-to-end vault factory scenarios
//!
//! Each test drives a factory backed by an in-memory asset ledger, mock
//! strategies and a manual clock. Stores live in SQLite, in memory or in a
//! temp directory when a restart is part of the scenario.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

use vaultfactory_backend::vault::VaultDb;
use vaultfactory_backend::{
    Address, Amount, InMemoryAssetLedger, ManualClock, MockStrategy, StrategyRegistry,
    VaultConfig, VaultError, VaultEvent, VaultFactory, VaultParams,
};

const DAY: i64 = 86_400;
const WEEK: u64 = 7 * DAY as u64;

struct Env {
    factory: Arc<VaultFactory>,
    ledger: Arc<InMemoryAssetLedger>,
    registry: Arc<StrategyRegistry>,
    clock: Arc<ManualClock>,
    owner: Address,
}

impl Env {
    async fn in_memory() -> Self {
        let ledger = Arc::new(InMemoryAssetLedger::new());
        let registry = Arc::new(StrategyRegistry::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let owner = Address::new("0xfactory-owner");
        let factory = VaultFactory::open_with_db(
            VaultDb::open_in_memory().unwrap(),
            VaultConfig::default(),
            owner.clone(),
            ledger.clone(),
            registry.clone(),
            clock.clone(),
        )
        .await
        .unwrap();
        Self {
            factory: Arc::new(factory),
            ledger,
            registry,
            clock,
            owner,
        }
    }

    async fn vault(&self, agent: &str, asset: &Address) -> Address {
        self.factory
            .create_vault(&self.owner, VaultParams::new(agent, asset.clone(), WEEK))
            .await
            .unwrap()
    }

    fn strategy(&self, id: &str, asset: &Address) -> Arc<MockStrategy> {
        let strategy = Arc::new(MockStrategy::new(
            Address::new(id),
            asset.clone(),
            self.ledger.clone(),
        ));
        self.registry.register(strategy.clone());
        strategy
    }
}

fn usdc() -> Address {
    Address::new("0xusdc")
}

#[tokio::test]
async fn test_profit_vests_over_unlock_window() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let vault = env.factory.vault(&a).unwrap();
    let x = Address::new("0xdepositor-x");
    env.ledger.mint(&usdc(), &x, 1_000);

    assert_eq!(vault.deposit(&x, 1_000, &x).await.unwrap(), 1_000);
    assert_eq!(vault.balance_of(&x).await, 1_000);
    assert_eq!(vault.total_assets().await, 1_000);

    let s = env.strategy("0xstrategy-s", &usdc());
    let sid = Address::new("0xstrategy-s");
    env.factory
        .add_strategy(&env.owner, &a, &sid, true)
        .await
        .unwrap();
    env.factory
        .set_max_debt(&env.owner, &a, &sid, 500)
        .await
        .unwrap();
    env.factory
        .rebalance_debt(&env.owner, &a, &sid, 500, 0)
        .await
        .unwrap();
    assert_eq!(vault.total_idle().await, 500);
    assert_eq!(s.balance(), 500);

    s.simulate_gain(100);
    let report = env
        .factory
        .process_report(&env.owner, &a, &sid)
        .await
        .unwrap();
    assert_eq!(report.gain, 100);
    assert_eq!(vault.total_assets().await, 1_000);
    assert!(vault.profit_unlocking_rate().await > 0);

    env.clock.advance_by(DAY);
    let one_day = vault.total_assets().await;
    assert!(one_day > 1_000 && one_day < 1_100, "got {}", one_day);

    env.clock.advance_by(DAY * 5 / 2);
    assert_eq!(vault.total_assets().await, 1_050);

    env.clock.advance_by(DAY * 7);
    assert_eq!(vault.total_assets().await, 1_100);
    assert_eq!(vault.locked_profit().await, 0);
    assert_eq!(vault.convert_to_assets(1_000).await.unwrap(), 1_100);
}

#[tokio::test]
async fn test_zero_unlock_window_releases_profit_at_once() {
    let env = Env::in_memory().await;
    let id = env
        .factory
        .create_vault(&env.owner, VaultParams::new("Instant", usdc(), 0))
        .await
        .unwrap();
    let vault = env.factory.vault(&id).unwrap();
    let x = Address::new("0xx");
    env.ledger.mint(&usdc(), &x, 1_000);
    vault.deposit(&x, 1_000, &x).await.unwrap();

    let s = env.strategy("0xs", &usdc());
    let sid = Address::new("0xs");
    env.factory.add_strategy(&env.owner, &id, &sid, true).await.unwrap();
    env.factory.set_max_debt(&env.owner, &id, &sid, 1_000).await.unwrap();
    env.factory
        .rebalance_debt(&env.owner, &id, &sid, 1_000, 0)
        .await
        .unwrap();

    s.simulate_gain(100);
    env.factory.process_report(&env.owner, &id, &sid).await.unwrap();
    assert_eq!(vault.total_assets().await, 1_100);
}

#[tokio::test]
async fn test_full_position_moves_between_vaults() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let b = env.vault("PoolB", &usdc()).await;
    let x = Address::new("0xdepositor-x");
    env.ledger.mint(&usdc(), &x, 1_000);
    env.factory
        .vault(&a)
        .unwrap()
        .deposit(&x, 1_000, &x)
        .await
        .unwrap();

    let mut rx = env.factory.subscribe();
    let moved = env
        .factory
        .rebalance_between_vaults(&x, &a, &b, 0)
        .await
        .unwrap();
    assert_eq!(moved, 1_000);

    let vault_a = env.factory.vault(&a).unwrap();
    let vault_b = env.factory.vault(&b).unwrap();
    assert_eq!(vault_a.balance_of(&x).await, 0);
    assert_eq!(vault_a.total_assets().await, 0);
    assert_eq!(vault_b.balance_of(&x).await, 1_000);
    assert_eq!(vault_b.total_assets().await, 1_000);
    assert_eq!(env.ledger.balance(&usdc(), vault_b.id()), 1_000);

    let mut rebalanced = None;
    while let Ok(event) = rx.try_recv() {
        if let VaultEvent::VaultsRebalanced { amount, .. } = event {
            rebalanced = Some(amount);
        }
    }
    assert_eq!(rebalanced, Some(1_000));

    let activity = env.factory.list_activity(10, Some(&a)).await.unwrap();
    assert!(activity.iter().any(|r| r.kind == "VAULTS_REBALANCED"));
}

#[tokio::test]
async fn test_rebalance_preconditions() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let d = env.vault("PoolD", &Address::new("0xdai")).await;
    let x = Address::new("0xx");
    env.ledger.mint(&usdc(), &x, 1_000);
    env.factory
        .vault(&a)
        .unwrap()
        .deposit(&x, 1_000, &x)
        .await
        .unwrap();

    let err = env
        .factory
        .rebalance_between_vaults(&x, &a, &d, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::AssetMismatch { .. }));

    let err = env
        .factory
        .rebalance_between_vaults(&x, &a, &a, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::SameVault { .. }));

    let ghost = Address::new("0xnever-created");
    let err = env
        .factory
        .rebalance_between_vaults(&x, &a, &ghost, 0)
        .await
        .unwrap_err();
    assert_eq!(err, VaultError::NotAVault { vault: ghost });
    assert_eq!(env.factory.vault(&a).unwrap().balance_of(&x).await, 1_000);
}

#[tokio::test]
async fn test_null_strategy_and_unknown_vault() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;

    let err = env
        .factory
        .add_strategy(&env.owner, &a, &Address::zero(), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidStrategy");

    let ghost = Address::new("0xdeadbeef");
    let sid = Address::new("0xs");
    for err in [
        env.factory
            .add_strategy(&env.owner, &ghost, &sid, true)
            .await
            .unwrap_err(),
        env.factory
            .set_max_debt(&env.owner, &ghost, &sid, 10)
            .await
            .unwrap_err(),
        env.factory
            .rebalance_debt(&env.owner, &ghost, &sid, 10, 0)
            .await
            .unwrap_err(),
        env.factory
            .revoke_strategy(&env.owner, &ghost, &sid)
            .await
            .unwrap_err(),
        env.factory
            .set_default_queue(&env.owner, &ghost, vec![])
            .await
            .unwrap_err(),
    ] {
        assert_eq!(err.kind(), "NotAVault");
    }
}

#[tokio::test]
async fn test_governance_is_per_vault() {
    let env = Env::in_memory().await;
    let gov = Address::new("0xpool-gov");
    let id = env
        .factory
        .create_vault(
            &env.owner,
            VaultParams::new("Delegated", usdc(), WEEK).with_governance(gov.clone()),
        )
        .await
        .unwrap();
    env.strategy("0xs", &usdc());
    let sid = Address::new("0xs");

    let err = env
        .factory
        .add_strategy(&env.owner, &id, &sid, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "Unauthorized");
    env.factory.add_strategy(&gov, &id, &sid, true).await.unwrap();
}

#[tokio::test]
async fn test_withdrawal_bounded_by_queue_liquidity() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let vault = env.factory.vault(&a).unwrap();
    let x = Address::new("0xx");
    env.ledger.mint(&usdc(), &x, 1_000);
    vault.deposit(&x, 1_000, &x).await.unwrap();

    let s1 = env.strategy("0xs1", &usdc());
    let s2 = env.strategy("0xs2", &usdc());
    let (id1, id2) = (Address::new("0xs1"), Address::new("0xs2"));
    for (id, max) in [(&id1, 400), (&id2, 300)] {
        env.factory.add_strategy(&env.owner, &a, id, true).await.unwrap();
        env.factory.set_max_debt(&env.owner, &a, id, max).await.unwrap();
        env.factory
            .rebalance_debt(&env.owner, &a, id, max, 0)
            .await
            .unwrap();
    }
    assert_eq!(vault.total_idle().await, 300);
    s1.set_liquidity_cap(Some(100));
    s2.set_liquidity_cap(Some(150));

    assert_eq!(vault.max_withdraw(&x).await.unwrap(), 550);
    let err = vault.withdraw(&x, 551, &x, &x).await.unwrap_err();
    assert_eq!(
        err,
        VaultError::InsufficientLiquidity {
            requested: 551,
            available: 550
        }
    );
    assert_eq!(vault.total_debt().await, 700);

    assert_eq!(vault.withdraw(&x, 550, &x, &x).await.unwrap(), 550);
    assert_eq!(env.ledger.balance(&usdc(), &x), 550);
    // queue order: s1 drained before s2
    assert_eq!(vault.strategies(&id1).await.unwrap().current_debt, 300);
    assert_eq!(vault.strategies(&id2).await.unwrap().current_debt, 150);
    assert_eq!(vault.total_idle().await, 0);
}

#[tokio::test]
async fn test_vaults_sharing_a_strategy_book_their_own_losses() {
    let env = Env::in_memory().await;
    let strategy = env.strategy("0xs", &usdc());
    let sid = Address::new("0xs");

    let mut vaults = Vec::new();
    for (agent, depositor) in [("PoolA", "0xxa"), ("PoolB", "0xxb")] {
        let id = env.vault(agent, &usdc()).await;
        let vault = env.factory.vault(&id).unwrap();
        let x = Address::new(depositor);
        env.ledger.mint(&usdc(), &x, 1_000);
        vault.deposit(&x, 1_000, &x).await.unwrap();
        env.factory.add_strategy(&env.owner, &id, &sid, true).await.unwrap();
        env.factory
            .set_max_debt(&env.owner, &id, &sid, 500)
            .await
            .unwrap();
        env.factory
            .rebalance_debt(&env.owner, &id, &sid, 500, 0)
            .await
            .unwrap();
        vaults.push((id, vault, x));
    }
    assert_eq!(strategy.balance(), 1_000);

    strategy.simulate_loss(200);
    for (id, vault, _) in &vaults {
        let report = env
            .factory
            .process_report(&env.owner, id, &sid)
            .await
            .unwrap();
        assert_eq!(report.gain, 0);
        assert_eq!(report.loss, 100);
        assert_eq!(vault.total_assets().await, 900);
        assert_eq!(vault.strategies(&sid).await.unwrap().current_debt, 400);
    }

    let (a, _, _) = &vaults[0];
    let (_, vault_b, xb) = &vaults[1];
    assert_eq!(vault_b.redeem(xb, 1_000, xb, xb).await.unwrap(), 900);
    assert_eq!(env.ledger.balance(&usdc(), xb), 900);
    assert_eq!(strategy.balance(), 400);
    assert_eq!(strategy.position(a), 400);
    assert_eq!(strategy.position(vault_b.id()), 0);
}

#[tokio::test]
async fn test_random_operations_conserve_assets() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let vault = env.factory.vault(&a).unwrap();
    let strategy = env.strategy("0xs", &usdc());
    let sid = Address::new("0xs");
    let max_debt: Amount = 5_000;
    env.factory.add_strategy(&env.owner, &a, &sid, true).await.unwrap();
    env.factory
        .set_max_debt(&env.owner, &a, &sid, max_debt)
        .await
        .unwrap();

    let users: Vec<Address> = (0..4).map(|i| Address::new(&format!("0xuser{}", i))).collect();
    for user in &users {
        env.ledger.mint(&usdc(), user, 10_000);
    }
    let held_by_users =
        |ledger: &InMemoryAssetLedger| -> Amount { users.iter().map(|u| ledger.balance(&usdc(), u)).sum() };
    let initial = held_by_users(&env.ledger);

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..300 {
        let user = &users[rng.gen_range(0..users.len())];
        let amount: Amount = rng.gen_range(0..3_000);
        let _ = match rng.gen_range(0..4) {
            0 => vault.deposit(user, amount, user).await,
            1 => vault.withdraw(user, amount, user, user).await,
            2 => vault.redeem(user, amount, user, user).await,
            _ => {
                env.factory
                    .rebalance_debt(&env.owner, &a, &sid, amount * 2, 0)
                    .await
            }
        };
        env.clock.advance_by(rng.gen_range(0..600));

        let net_inflow = initial - held_by_users(&env.ledger);
        let idle = vault.total_idle().await;
        let debt = vault.total_debt().await;
        assert_eq!(idle + debt, net_inflow);
        assert_eq!(env.ledger.balance(&usdc(), vault.id()), idle);
        assert_eq!(strategy.balance(), debt);

        let record = vault.strategies(&sid).await.unwrap();
        assert!(record.current_debt <= max_debt);
        assert_eq!(record.current_debt, debt);

        let mut supply = 0;
        for user in &users {
            supply += vault.balance_of(user).await;
        }
        assert_eq!(supply, vault.total_supply().await);
    }
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig {
        database_path: dir.path().join("vaults.db").to_string_lossy().to_string(),
        ..Default::default()
    };
    let ledger = Arc::new(InMemoryAssetLedger::new());
    let registry = Arc::new(StrategyRegistry::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let owner = Address::new("0xowner");
    let x = Address::new("0xx");
    let bob = Address::new("0xbob");
    let sid = Address::new("0xs");
    let strategy = Arc::new(MockStrategy::new(sid.clone(), usdc(), ledger.clone()));
    registry.register(strategy.clone());
    ledger.mint(&usdc(), &x, 1_000);

    let (a, b) = {
        let factory = VaultFactory::open(
            config.clone(),
            owner.clone(),
            ledger.clone(),
            registry.clone(),
            clock.clone(),
        )
        .await
        .unwrap();
        let a = factory
            .create_vault(
                &owner,
                VaultParams::new("PoolA", usdc(), WEEK).with_strategy(sid.clone(), 600, true),
            )
            .await
            .unwrap();
        let b = factory
            .create_vault(&owner, VaultParams::new("PoolB", usdc(), WEEK))
            .await
            .unwrap();

        let vault = factory.vault(&a).unwrap();
        vault.deposit(&x, 1_000, &x).await.unwrap();
        vault.approve(&x, &bob, 40).await.unwrap();
        factory.rebalance_debt(&owner, &a, &sid, 600, 0).await.unwrap();
        strategy.simulate_gain(70);
        factory.process_report(&owner, &a, &sid).await.unwrap();
        (a, b)
    };

    clock.advance_by(DAY);
    let factory = VaultFactory::open(config, owner.clone(), ledger.clone(), registry, clock)
        .await
        .unwrap();
    assert_eq!(factory.list_all_vaults(), vec![a.clone(), b.clone()]);
    assert_eq!(factory.get_vault(1).unwrap().agent_name, "PoolB");

    let vault = factory.vault(&a).unwrap();
    assert_eq!(vault.balance_of(&x).await, 1_000);
    assert_eq!(vault.allowance(&x, &bob).await, 40);
    assert_eq!(vault.total_idle().await, 400);
    assert_eq!(vault.total_debt().await, 670);
    assert_eq!(vault.get_default_queue().await, vec![sid.clone()]);
    assert_eq!(vault.strategies(&sid).await.unwrap().max_debt, 600);
    // one day of seven unlocked: 60 of 70 still locked
    assert_eq!(vault.locked_profit().await, 60);
    assert_eq!(vault.total_assets().await, 1_010);

    let activity = factory.list_activity(100, Some(&a)).await.unwrap();
    assert!(activity.iter().any(|r| r.kind == "STRATEGY_REPORTED"));
    assert!(activity.iter().any(|r| r.kind == "VAULT_CREATED"));

    // the restored vault keeps working
    vault.redeem(&x, 100, &x, &x).await.unwrap();
    assert_eq!(vault.balance_of(&x).await, 900);
}

#[tokio::test]
async fn test_failed_transfers_leave_ledgers_unchanged() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let vault = env.factory.vault(&a).unwrap();
    let x = Address::new("0xx");
    let frozen = Address::new("0xfrozen");
    env.ledger.mint(&usdc(), &x, 1_000);
    env.ledger.mint(&usdc(), &frozen, 1_000);
    vault.deposit(&x, 600, &x).await.unwrap();

    env.ledger.freeze(&frozen);
    let err = vault.deposit(&frozen, 100, &frozen).await.unwrap_err();
    assert_eq!(err.kind(), "TransferFailed");

    let err = vault.redeem(&x, 300, &frozen, &x).await.unwrap_err();
    assert_eq!(err.kind(), "TransferFailed");

    let snapshot = vault.snapshot().await;
    assert_eq!(snapshot.total_supply, 600);
    assert_eq!(snapshot.total_idle, 600);
    assert_eq!(vault.balance_of(&x).await, 600);
    assert_eq!(env.ledger.balance(&usdc(), vault.id()), 600);
    assert_eq!(env.ledger.balance(&usdc(), &frozen), 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_rebalances_do_not_deadlock() {
    let env = Env::in_memory().await;
    let a = env.vault("PoolA", &usdc()).await;
    let b = env.vault("PoolB", &usdc()).await;
    let x = Address::new("0xx");
    let y = Address::new("0xy");
    env.ledger.mint(&usdc(), &x, 1_000);
    env.ledger.mint(&usdc(), &y, 1_000);
    env.factory.vault(&a).unwrap().deposit(&x, 1_000, &x).await.unwrap();
    env.factory.vault(&b).unwrap().deposit(&y, 1_000, &y).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let factory = env.factory.clone();
        let (who, from, to) = if i % 2 == 0 {
            (x.clone(), a.clone(), b.clone())
        } else {
            (y.clone(), b.clone(), a.clone())
        };
        handles.push(tokio::spawn(async move {
            factory.rebalance_between_vaults(&who, &from, &to, 10).await
        }));
    }

    let joined = tokio::time::timeout(Duration::from_secs(10), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "rebalances deadlocked");

    let vault_a = env.factory.vault(&a).unwrap();
    let vault_b = env.factory.vault(&b).unwrap();
    assert_eq!(vault_a.balance_of(&x).await, 900);
    assert_eq!(vault_b.balance_of(&x).await, 100);
    assert_eq!(vault_b.balance_of(&y).await, 900);
    assert_eq!(vault_a.balance_of(&y).await, 100);
    assert_eq!(
        vault_a.total_assets().await + vault_b.total_assets().await,
        2_000
    );
}
