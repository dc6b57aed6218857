//! Durable storage behind the quota ledger.

use super::{CredentialSource, ProviderUsage, UsageRecord, UsageSummary};
use crate::providers::ProviderKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Balance get/set and append-only usage history.
///
/// Implementations are synchronous; the ledger calls them while holding a
/// tenant lock and never across an await.
pub trait LedgerStore: Send + Sync {
    /// Stored balance, or `None` for a tenant never persisted.
    fn balance(&self, tenant_id: &str) -> Result<Option<u64>>;

    fn set_balance(&self, tenant_id: &str, remaining_blocks: u64) -> Result<()>;

    /// Write the new balance and append the record atomically.
    fn apply_settlement(
        &self,
        tenant_id: &str,
        remaining_blocks: u64,
        record: &UsageRecord,
    ) -> Result<()>;

    /// Most recent records for a tenant, newest first.
    fn recent_usage(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageRecord>>;

    /// Totals over `[from, to]`, inclusive.
    fn summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<UsageSummary>;
}

// ── SQLite ───────────────────────────────────────────────────────

pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger DB: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenant_balances (
                tenant_id        TEXT PRIMARY KEY,
                remaining_blocks INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS usage_records (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id         TEXT NOT NULL,
                model_id          TEXT NOT NULL,
                units_consumed    INTEGER NOT NULL,
                blocks_deducted   INTEGER NOT NULL,
                credential_source TEXT NOT NULL,
                provider          TEXT NOT NULL,
                timestamp_ms      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_tenant ON usage_records(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp_ms);",
        )?;
        Ok(())
    }

    fn upsert_balance(conn: &Connection, tenant_id: &str, remaining_blocks: u64) -> Result<()> {
        conn.execute(
            "INSERT INTO tenant_balances (tenant_id, remaining_blocks) VALUES (?1, ?2)
             ON CONFLICT(tenant_id) DO UPDATE SET remaining_blocks = excluded.remaining_blocks",
            params![tenant_id, to_sql_int(remaining_blocks)?],
        )?;
        Ok(())
    }
}

type RawUsageRow = (String, String, i64, i64, String, String, i64);

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).context("value too large for storage")
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value).context("negative value in storage")
}

fn record_from_row(row: RawUsageRow) -> Result<UsageRecord> {
    let (tenant_id, model_id, units, blocks, source, provider, ts_ms) = row;
    Ok(UsageRecord {
        tenant_id,
        model_id,
        units_consumed: from_sql_int(units)?,
        blocks_deducted: from_sql_int(blocks)?,
        credential_source: source.parse::<CredentialSource>()?,
        provider: provider.parse::<ProviderKind>()?,
        timestamp: DateTime::<Utc>::from_timestamp_millis(ts_ms)
            .context("usage timestamp out of range")?,
    })
}

impl LedgerStore for SqliteLedgerStore {
    fn balance(&self, tenant_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let stored: Option<i64> = conn
            .query_row(
                "SELECT remaining_blocks FROM tenant_balances WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        stored.map(from_sql_int).transpose()
    }

    fn set_balance(&self, tenant_id: &str, remaining_blocks: u64) -> Result<()> {
        let conn = self.conn.lock();
        Self::upsert_balance(&conn, tenant_id, remaining_blocks)
    }

    fn apply_settlement(
        &self,
        tenant_id: &str,
        remaining_blocks: u64,
        record: &UsageRecord,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::upsert_balance(&tx, tenant_id, remaining_blocks)?;
        tx.execute(
            "INSERT INTO usage_records
                (tenant_id, model_id, units_consumed, blocks_deducted, credential_source, provider, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.tenant_id,
                record.model_id,
                to_sql_int(record.units_consumed)?,
                to_sql_int(record.blocks_deducted)?,
                record.credential_source.as_str(),
                record.provider.id(),
                record.timestamp.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn recent_usage(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, model_id, units_consumed, blocks_deducted, credential_source, provider, timestamp_ms
             FROM usage_records WHERE tenant_id = ?1
             ORDER BY timestamp_ms DESC, id DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![tenant_id, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<RawUsageRow>>>()?;
        rows.into_iter().map(record_from_row).collect()
    }

    fn summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<UsageSummary> {
        let conn = self.conn.lock();
        let from_ms = from.timestamp_millis();
        let to_ms = to.timestamp_millis();

        let (count, blocks, units): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(blocks_deducted), 0), COALESCE(SUM(units_consumed), 0)
             FROM usage_records WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2",
            params![from_ms, to_ms],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT provider, COUNT(*), COALESCE(SUM(blocks_deducted), 0), COALESCE(SUM(units_consumed), 0)
             FROM usage_records WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2
             GROUP BY provider ORDER BY provider",
        )?;
        let raw = stmt
            .query_map(params![from_ms, to_ms], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut by_provider = Vec::with_capacity(raw.len());
        for (provider, count, blocks, units) in raw {
            by_provider.push(ProviderUsage {
                provider: provider.parse()?,
                request_count: from_sql_int(count)?,
                blocks: from_sql_int(blocks)?,
                units: from_sql_int(units)?,
            });
        }
        by_provider.sort_by_key(|p| p.provider);

        Ok(UsageSummary {
            request_count: from_sql_int(count)?,
            total_blocks: from_sql_int(blocks)?,
            total_units: from_sql_int(units)?,
            by_provider,
        })
    }
}

// ── In-memory ────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryLedger {
    balances: HashMap<String, u64>,
    usage: Vec<UsageRecord>,
}

/// Non-durable store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<MemoryLedger>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn balance(&self, tenant_id: &str) -> Result<Option<u64>> {
        Ok(self.inner.lock().balances.get(tenant_id).copied())
    }

    fn set_balance(&self, tenant_id: &str, remaining_blocks: u64) -> Result<()> {
        self.inner
            .lock()
            .balances
            .insert(tenant_id.to_string(), remaining_blocks);
        Ok(())
    }

    fn apply_settlement(
        &self,
        tenant_id: &str,
        remaining_blocks: u64,
        record: &UsageRecord,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .balances
            .insert(tenant_id.to_string(), remaining_blocks);
        inner.usage.push(record.clone());
        Ok(())
    }

    fn recent_usage(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .usage
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<UsageSummary> {
        let inner = self.inner.lock();
        let mut summary = UsageSummary::default();
        let mut by_provider: BTreeMap<ProviderKind, ProviderUsage> = BTreeMap::new();

        for record in inner
            .usage
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
        {
            summary.request_count += 1;
            summary.total_blocks += record.blocks_deducted;
            summary.total_units += record.units_consumed;
            let entry = by_provider
                .entry(record.provider)
                .or_insert_with(|| ProviderUsage {
                    provider: record.provider,
                    request_count: 0,
                    blocks: 0,
                    units: 0,
                });
            entry.request_count += 1;
            entry.blocks += record.blocks_deducted;
            entry.units += record.units_consumed;
        }

        summary.by_provider = by_provider.into_values().collect();
        Ok(summary)
    }
}
