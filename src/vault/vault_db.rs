use anyhow::{Context, Result};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Timestamp;
use crate::vault::events::VaultActivityRecord;
use crate::vault::math::Amount;
use crate::vault::queue::DefaultQueue;
use crate::vault::state::{DirtyRows, VaultState};
use crate::vault::types::{Address, StrategyRecord, VaultParams};

/// Registry row for one deployed vault.
#[derive(Debug, Clone)]
pub struct StoredVault {
    pub index: u64,
    pub vault_id: Address,
    pub governance: Address,
    pub params: VaultParams,
    pub created_at: Timestamp,
}

/// Factory-level settings that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryMeta {
    pub owner: Address,
    pub vault_implementation: String,
}

/// Staged write for one vault: the state to persist and the share-ledger rows
/// that changed since the last write.
pub struct VaultWrite<'a> {
    pub vault_id: &'a Address,
    pub state: &'a VaultState,
    pub dirty: &'a DirtyRows,
}

#[derive(Clone)]
pub struct VaultDb {
    conn: Arc<Mutex<Connection>>,
}

impl VaultDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open vault db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory vault db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS factory_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner TEXT NOT NULL,
                vault_implementation TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS factory_vaults (
                seq INTEGER PRIMARY KEY,
                vault_id TEXT NOT NULL UNIQUE,
                governance TEXT NOT NULL,
                params TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_state (
                vault_id TEXT PRIMARY KEY,
                total_idle TEXT NOT NULL,
                total_debt TEXT NOT NULL,
                total_supply TEXT NOT NULL,
                profit_max_unlock_time INTEGER NOT NULL,
                locked_at_update TEXT NOT NULL,
                last_update INTEGER NOT NULL,
                full_profit_unlock_date INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_shares (
                vault_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                shares TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (vault_id, holder)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_allowances (
                vault_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                spender TEXT NOT NULL,
                shares TEXT NOT NULL,
                PRIMARY KEY (vault_id, owner, spender)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_strategies (
                vault_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                activation INTEGER NOT NULL,
                current_debt TEXT NOT NULL,
                max_debt TEXT NOT NULL,
                last_report INTEGER NOT NULL,
                PRIMARY KEY (vault_id, strategy)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_queue (
                vault_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                PRIMARY KEY (vault_id, position)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_activity (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                vault_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vault_activity_ts ON vault_activity(ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vault_activity_vault_ts ON vault_activity(vault_id, ts DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // FACTORY REGISTRY
    // =========================================================================

    pub async fn load_factory_meta(&self) -> Result<Option<FactoryMeta>> {
        let conn = self.conn.lock().await;
        let meta = conn
            .query_row(
                "SELECT owner, vault_implementation FROM factory_meta WHERE id = 1",
                [],
                |row| {
                    let owner: String = row.get(0)?;
                    Ok(FactoryMeta {
                        owner: Address::new(&owner),
                        vault_implementation: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub async fn upsert_factory_meta(&self, meta: &FactoryMeta, updated_at: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO factory_meta (id, owner, vault_implementation, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                vault_implementation = excluded.vault_implementation,
                updated_at = excluded.updated_at",
            params![meta.owner.as_str(), &meta.vault_implementation, updated_at],
        )?;
        Ok(())
    }

    /// Register a vault and write its initial ledger in one transaction.
    pub async fn insert_vault(
        &self,
        record: &StoredVault,
        state: &VaultState,
        dirty: &DirtyRows,
    ) -> Result<()> {
        let params_json = serde_json::to_string(&record.params).context("encode vault params")?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO factory_vaults (seq, vault_id, governance, params, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.index as i64,
                record.vault_id.as_str(),
                record.governance.as_str(),
                params_json,
                record.created_at,
            ],
        )
        .context("insert factory vault")?;
        write_state(
            &tx,
            &VaultWrite {
                vault_id: &record.vault_id,
                state,
                dirty,
            },
            record.created_at,
        )?;
        tx.commit().context("commit vault creation")?;
        Ok(())
    }

    /// All registered vaults in creation order.
    pub async fn load_registry(&self) -> Result<Vec<StoredVault>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, vault_id, governance, params, created_at FROM factory_vaults ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let vault_id: String = row.get(1)?;
            let governance: String = row.get(2)?;
            let params_json: String = row.get(3)?;
            let created_at: i64 = row.get(4)?;
            Ok((seq, vault_id, governance, params_json, created_at))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (seq, vault_id, governance, params_json, created_at) = r?;
            let params: VaultParams = serde_json::from_str(&params_json)
                .with_context(|| format!("decode params of vault {}", vault_id))?;
            out.push(StoredVault {
                index: seq as u64,
                vault_id: Address::new(&vault_id),
                governance: Address::new(&governance),
                params,
                created_at,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // VAULT LEDGERS
    // =========================================================================

    pub async fn save_vault(&self, write: VaultWrite<'_>, updated_at: i64) -> Result<()> {
        self.save_vaults(&[write], updated_at).await
    }

    /// Persist several vaults atomically. Either every ledger is written or
    /// none is.
    pub async fn save_vaults(&self, writes: &[VaultWrite<'_>], updated_at: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for write in writes {
            write_state(&tx, write, updated_at)
                .with_context(|| format!("save vault {}", write.vault_id))?;
        }
        tx.commit().context("commit vault state")?;
        Ok(())
    }

    pub async fn load_vault_state(&self, vault_id: &Address) -> Result<Option<VaultState>> {
        let conn = self.conn.lock().await;
        let id = vault_id.as_str();

        let header = conn
            .query_row(
                "SELECT total_idle, total_debt, total_supply, profit_max_unlock_time,
                        locked_at_update, last_update, full_profit_unlock_date
                 FROM vault_state WHERE vault_id = ?1",
                [id],
                |row| {
                    let unlock_time: i64 = row.get(3)?;
                    let mut state = VaultState::new(unlock_time as u64);
                    state.total_idle = amount_at(row, 0)?;
                    state.total_debt = amount_at(row, 1)?;
                    state.total_supply = amount_at(row, 2)?;
                    state.profit_unlock.locked_at_update = amount_at(row, 4)?;
                    state.profit_unlock.last_update = row.get(5)?;
                    state.profit_unlock.full_profit_unlock_date = row.get(6)?;
                    Ok(state)
                },
            )
            .optional()?;
        let Some(mut state) = header else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare_cached("SELECT holder, shares FROM vault_shares WHERE vault_id = ?1")?;
        let rows = stmt.query_map([id], |row| {
            let holder: String = row.get(0)?;
            Ok((Address::new(&holder), amount_at(row, 1)?))
        })?;
        for r in rows {
            let (holder, shares) = r?;
            state.balances.insert(holder, shares);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT owner, spender, shares FROM vault_allowances WHERE vault_id = ?1",
        )?;
        let rows = stmt.query_map([id], |row| {
            let owner: String = row.get(0)?;
            let spender: String = row.get(1)?;
            Ok((Address::new(&owner), Address::new(&spender), amount_at(row, 2)?))
        })?;
        for r in rows {
            let (owner, spender, shares) = r?;
            state.allowances.insert((owner, spender), shares);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT strategy, activation, current_debt, max_debt, last_report
             FROM vault_strategies WHERE vault_id = ?1",
        )?;
        let rows = stmt.query_map([id], |row| {
            let strategy: String = row.get(0)?;
            Ok((
                Address::new(&strategy),
                StrategyRecord {
                    activation: row.get(1)?,
                    current_debt: amount_at(row, 2)?,
                    max_debt: amount_at(row, 3)?,
                    last_report: row.get(4)?,
                },
            ))
        })?;
        for r in rows {
            let (strategy, record) = r?;
            state.strategies.insert(strategy, record);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT strategy FROM vault_queue WHERE vault_id = ?1 ORDER BY position ASC",
        )?;
        let queue = stmt
            .query_map([id], |row| {
                let strategy: String = row.get(0)?;
                Ok(Address::new(&strategy))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        state.default_queue = DefaultQueue::from_ordered(queue)
            .map_err(|dup| anyhow::anyhow!("duplicate queue entry {} in vault {}", dup, id))?;

        Ok(Some(state))
    }

    // =========================================================================
    // ACTIVITY LOG
    // =========================================================================

    pub async fn insert_activity(&self, rec: &VaultActivityRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO vault_activity (id, ts, vault_id, kind, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&rec.id, rec.ts, &rec.vault, &rec.kind, &rec.payload],
        )?;
        Ok(())
    }

    pub async fn list_activity(
        &self,
        limit: usize,
        vault_id: Option<&Address>,
    ) -> Result<Vec<VaultActivityRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;

        // rowid breaks ties between events committed in the same second
        let rows = if let Some(vault_id) = vault_id {
            let mut stmt = conn.prepare_cached(
                "SELECT id, ts, vault_id, kind, payload FROM vault_activity \
                 WHERE vault_id = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![vault_id.as_str(), limit], activity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT id, ts, vault_id, kind, payload FROM vault_activity \
                 ORDER BY ts DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], activity_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        Ok(rows)
    }
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<VaultActivityRecord> {
    Ok(VaultActivityRecord {
        id: row.get(0)?,
        ts: row.get(1)?,
        vault: row.get(2)?,
        kind: row.get(3)?,
        payload: row.get(4)?,
    })
}

/// u128 quantities do not fit SQLite integers and are stored as decimal text.
fn amount_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Amount> {
    let raw: String = row.get(idx)?;
    raw.parse::<Amount>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn write_state(tx: &Transaction<'_>, write: &VaultWrite<'_>, updated_at: i64) -> Result<()> {
    let id = write.vault_id.as_str();
    let state = write.state;

    tx.execute(
        "INSERT INTO vault_state (vault_id, total_idle, total_debt, total_supply,
            profit_max_unlock_time, locked_at_update, last_update, full_profit_unlock_date, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(vault_id) DO UPDATE SET
            total_idle = excluded.total_idle,
            total_debt = excluded.total_debt,
            total_supply = excluded.total_supply,
            profit_max_unlock_time = excluded.profit_max_unlock_time,
            locked_at_update = excluded.locked_at_update,
            last_update = excluded.last_update,
            full_profit_unlock_date = excluded.full_profit_unlock_date,
            updated_at = excluded.updated_at",
        params![
            id,
            state.total_idle.to_string(),
            state.total_debt.to_string(),
            state.total_supply.to_string(),
            state.profit_max_unlock_time as i64,
            state.profit_unlock.locked_at_update.to_string(),
            state.profit_unlock.last_update,
            state.profit_unlock.full_profit_unlock_date,
            updated_at,
        ],
    )?;

    for holder in &write.dirty.holders {
        let shares = state.balance_of(holder);
        if shares == 0 {
            tx.execute(
                "DELETE FROM vault_shares WHERE vault_id = ?1 AND holder = ?2",
                params![id, holder.as_str()],
            )?;
            continue;
        }
        tx.execute(
            "INSERT INTO vault_shares (vault_id, holder, shares, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(vault_id, holder) DO UPDATE SET
                shares = excluded.shares,
                updated_at = excluded.updated_at",
            params![id, holder.as_str(), shares.to_string(), updated_at],
        )?;
    }

    for (owner, spender) in &write.dirty.allowances {
        let shares = state.allowance(owner, spender);
        if shares == 0 {
            tx.execute(
                "DELETE FROM vault_allowances WHERE vault_id = ?1 AND owner = ?2 AND spender = ?3",
                params![id, owner.as_str(), spender.as_str()],
            )?;
            continue;
        }
        tx.execute(
            "INSERT INTO vault_allowances (vault_id, owner, spender, shares)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(vault_id, owner, spender) DO UPDATE SET shares = excluded.shares",
            params![id, owner.as_str(), spender.as_str(), shares.to_string()],
        )?;
    }

    // Strategy and queue tables are small; rewrite them whole.
    tx.execute("DELETE FROM vault_strategies WHERE vault_id = ?1", [id])?;
    for (strategy, rec) in &state.strategies {
        tx.execute(
            "INSERT INTO vault_strategies (vault_id, strategy, activation, current_debt, max_debt, last_report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                strategy.as_str(),
                rec.activation,
                rec.current_debt.to_string(),
                rec.max_debt.to_string(),
                rec.last_report,
            ],
        )?;
    }

    tx.execute("DELETE FROM vault_queue WHERE vault_id = ?1", [id])?;
    for (position, strategy) in state.default_queue.iter().enumerate() {
        tx.execute(
            "INSERT INTO vault_queue (vault_id, position, strategy) VALUES (?1, ?2, ?3)",
            params![id, position as i64, strategy.as_str()],
        )?;
    }

    Ok(())
}
