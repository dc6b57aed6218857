//! Durable storage behind the credential vault.

use super::pool::{CredentialStatus, VaultCredential};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;

/// Credential load/upsert/delete. Only ciphertext ever reaches a store.
pub trait VaultStore: Send + Sync {
    /// Every credential, ordered by rotation position.
    fn load_all(&self) -> Result<Vec<VaultCredential>>;

    fn upsert(&self, credential: &VaultCredential) -> Result<()>;

    /// Returns whether a row was removed.
    fn delete(&self, id: &str) -> Result<bool>;
}

// ── SQLite ───────────────────────────────────────────────────────

pub struct SqliteVaultStore {
    conn: Mutex<Connection>,
}

impl SqliteVaultStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create vault dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open vault DB: {}", path.display()))?;
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
            "CREATE TABLE IF NOT EXISTS vault_credentials (
                id                 TEXT PRIMARY KEY,
                provider           TEXT NOT NULL,
                encrypted_secret   TEXT NOT NULL,
                cumulative_units   INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL,
                capacity_per_cycle INTEGER NOT NULL,
                last_used_ms       INTEGER,
                created_ms         INTEGER NOT NULL,
                rotation_position  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vault_provider ON vault_credentials(provider, rotation_position);",
        )?;
        Ok(())
    }
}

type RawCredentialRow = (String, String, String, i64, String, i64, Option<i64>, i64, i64);

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).context("value too large for storage")
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value).context("negative value in storage")
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).context("timestamp out of range")
}

fn credential_from_row(row: RawCredentialRow) -> Result<VaultCredential> {
    let (id, provider, encrypted_secret, used, status, capacity, last_used, created, position) = row;
    Ok(VaultCredential {
        provider: provider
            .parse()
            .with_context(|| format!("credential {id}"))?,
        encrypted_secret,
        cumulative_units: from_sql_int(used)?,
        status: status.parse::<CredentialStatus>()?,
        capacity_per_cycle: from_sql_int(capacity)?,
        last_used_at: last_used.map(millis_to_datetime).transpose()?,
        created_at: millis_to_datetime(created)?,
        rotation_position: from_sql_int(position)?,
        id,
    })
}

impl VaultStore for SqliteVaultStore {
    fn load_all(&self) -> Result<Vec<VaultCredential>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, provider, encrypted_secret, cumulative_units, status, capacity_per_cycle,
                    last_used_ms, created_ms, rotation_position
             FROM vault_credentials ORDER BY rotation_position, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<RawCredentialRow>>>()?;
        rows.into_iter().map(credential_from_row).collect()
    }

    fn upsert(&self, credential: &VaultCredential) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vault_credentials
                (id, provider, encrypted_secret, cumulative_units, status, capacity_per_cycle,
                 last_used_ms, created_ms, rotation_position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                cumulative_units   = excluded.cumulative_units,
                status             = excluded.status,
                capacity_per_cycle = excluded.capacity_per_cycle,
                last_used_ms       = excluded.last_used_ms,
                rotation_position  = excluded.rotation_position",
            params![
                credential.id,
                credential.provider.id(),
                credential.encrypted_secret(),
                to_sql_int(credential.cumulative_units)?,
                credential.status.as_str(),
                to_sql_int(credential.capacity_per_cycle)?,
                credential.last_used_at.map(|t| t.timestamp_millis()),
                credential.created_at.timestamp_millis(),
                to_sql_int(credential.rotation_position)?,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM vault_credentials WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

// ── In-memory ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryVaultStore {
    credentials: Mutex<BTreeMap<String, VaultCredential>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultStore for MemoryVaultStore {
    fn load_all(&self) -> Result<Vec<VaultCredential>> {
        let mut all: Vec<VaultCredential> = self.credentials.lock().values().cloned().collect();
        all.sort_by(|a, b| {
            a.rotation_position
                .cmp(&b.rotation_position)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(all)
    }

    fn upsert(&self, credential: &VaultCredential) -> Result<()> {
        self.credentials
            .lock()
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.credentials.lock().remove(id).is_some())
    }
}
