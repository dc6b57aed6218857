//! Credential vault: pooled upstream keys, rotation and cooldown.
//!
//! ## Design
//! - One pool per provider, each behind its own mutex; the provider set is
//!   closed so the pools are created up front
//! - Secrets are AES-256-GCM encrypted before they reach the store and are
//!   decrypted only through [`CredentialVault::reveal`]
//! - A credential that reaches its capacity cools down at the back of the
//!   rotation and is reclaimed lazily on the next `select` (or by `sweep`)
//! - Every change is persisted before it becomes visible in memory

pub mod pool;
pub mod store;

pub use pool::{CredentialStatus, ProviderPool, UsageOutcome, VaultCredential};
pub use store::{MemoryVaultStore, SqliteVaultStore, VaultStore};

use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::providers::ProviderKind;
use crate::security::AesEncryptor;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultSettings {
    pub cooldown: Duration,
    pub default_capacity: u64,
}

impl From<&VaultConfig> for VaultSettings {
    fn from(config: &VaultConfig) -> Self {
        Self {
            cooldown: i64::try_from(config.cooldown_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
            default_capacity: config.default_capacity_per_cycle,
        }
    }
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self::from(&VaultConfig::default())
    }
}

/// The credential picked for one in-flight call.
///
/// Carries the ciphertext so the call can proceed even if an admin removes
/// the credential meanwhile.
pub struct CredentialLease {
    credential_id: String,
    provider: ProviderKind,
    encrypted_secret: String,
}

impl CredentialLease {
    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Admin view of a credential. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub provider: ProviderKind,
    pub status: CredentialStatus,
    pub cumulative_units: u64,
    pub capacity_per_cycle: u64,
    pub headroom: u64,
    pub rotation_position: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&VaultCredential> for CredentialSummary {
    fn from(c: &VaultCredential) -> Self {
        Self {
            id: c.id.clone(),
            provider: c.provider,
            status: c.status,
            cumulative_units: c.cumulative_units,
            capacity_per_cycle: c.capacity_per_cycle,
            headroom: c.headroom(),
            rotation_position: c.rotation_position,
            last_used_at: c.last_used_at,
            created_at: c.created_at,
        }
    }
}

/// Per-provider status counts for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub active: usize,
    pub cooling: usize,
    pub disabled: usize,
}

pub struct CredentialVault {
    pools: HashMap<ProviderKind, Mutex<ProviderPool>>,
    store: Arc<dyn VaultStore>,
    encryptor: AesEncryptor,
    clock: Arc<dyn Clock>,
    settings: VaultSettings,
    next_position: AtomicU64,
}

impl CredentialVault {
    /// Load every stored credential into its provider pool.
    pub fn open(
        store: Arc<dyn VaultStore>,
        encryptor: AesEncryptor,
        clock: Arc<dyn Clock>,
        settings: VaultSettings,
    ) -> Result<Self> {
        let all = store.load_all()?;
        let next_position = all
            .iter()
            .map(|c| c.rotation_position + 1)
            .max()
            .unwrap_or(0);

        let mut grouped: HashMap<ProviderKind, Vec<VaultCredential>> = HashMap::new();
        for credential in all {
            grouped
                .entry(credential.provider)
                .or_default()
                .push(credential);
        }
        let pools = ProviderKind::ALL
            .iter()
            .map(|&kind| {
                let credentials = grouped.remove(&kind).unwrap_or_default();
                (kind, Mutex::new(ProviderPool::new(credentials)))
            })
            .collect();

        Ok(Self {
            pools,
            store,
            encryptor,
            clock,
            settings,
            next_position: AtomicU64::new(next_position),
        })
    }

    fn pool(&self, provider: ProviderKind) -> &Mutex<ProviderPool> {
        // Every ProviderKind gets a pool in `open`.
        &self.pools[&provider]
    }

    fn take_position(&self) -> u64 {
        self.next_position.fetch_add(1, Ordering::SeqCst)
    }

    /// Persist and apply cooldown reclaims for one pool. Caller holds the lock.
    fn reclaim_locked(&self, pool: &mut ProviderPool, now: DateTime<Utc>) -> Result<usize> {
        let reclaimed = pool.reclaimable(now, self.settings.cooldown);
        let count = reclaimed.len();
        for credential in reclaimed {
            self.store.upsert(&credential)?;
            tracing::info!(
                provider = %credential.provider,
                credential = %credential.id,
                "credential reclaimed after cooldown"
            );
            pool.commit(credential);
        }
        Ok(count)
    }

    /// Pick a credential for `provider`. `None` when the provider has no
    /// active credential left.
    pub fn select(
        &self,
        provider: ProviderKind,
        estimated_units: u64,
    ) -> Result<Option<CredentialLease>> {
        let now = self.clock.now();
        let mut pool = self.pool(provider).lock();
        self.reclaim_locked(&mut pool, now)?;

        let Some(credential) = pool.select(estimated_units) else {
            tracing::warn!(provider = %provider, "no active credential available");
            return Ok(None);
        };
        tracing::debug!(
            provider = %provider,
            credential = %credential.id,
            headroom = credential.headroom(),
            estimated_units,
            "credential selected"
        );
        Ok(Some(CredentialLease {
            credential_id: credential.id.clone(),
            provider,
            encrypted_secret: credential.encrypted_secret().to_string(),
        }))
    }

    /// Decrypt the leased secret for the outbound call.
    pub fn reveal(&self, lease: &CredentialLease) -> Result<SecretString> {
        self.encryptor.decrypt(&lease.encrypted_secret)
    }

    /// Count `units` against the leased credential.
    pub fn report_usage(&self, lease: &CredentialLease, units: u64) -> Result<Option<UsageOutcome>> {
        let now = self.clock.now();
        let mut pool = self.pool(lease.provider).lock();

        let back_of_line = self.next_position.load(Ordering::SeqCst);
        let Some((mut updated, outcome)) =
            pool.with_usage(&lease.credential_id, units, now, back_of_line)
        else {
            tracing::warn!(
                provider = %lease.provider,
                credential = %lease.credential_id,
                "usage reported for a credential that no longer exists"
            );
            return Ok(None);
        };

        if outcome == UsageOutcome::Exhausted {
            updated.rotation_position = self.take_position();
        }
        self.store.upsert(&updated)?;
        if outcome == UsageOutcome::Exhausted {
            tracing::info!(
                provider = %lease.provider,
                credential = %lease.credential_id,
                units = updated.cumulative_units,
                capacity = updated.capacity_per_cycle,
                "credential reached capacity, cooling down"
            );
        }
        pool.commit(updated);
        Ok(Some(outcome))
    }

    /// Encrypt and store a new credential at the back of its provider's
    /// rotation.
    pub fn add_credential(
        &self,
        provider: ProviderKind,
        secret: &SecretString,
        capacity_per_cycle: Option<u64>,
    ) -> Result<CredentialSummary> {
        let capacity = capacity_per_cycle.unwrap_or(self.settings.default_capacity);
        if capacity == 0 {
            anyhow::bail!("capacity_per_cycle must be greater than zero");
        }

        let credential = VaultCredential {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            encrypted_secret: self.encryptor.encrypt(secret)?,
            cumulative_units: 0,
            status: CredentialStatus::Active,
            capacity_per_cycle: capacity,
            last_used_at: None,
            created_at: self.clock.now(),
            rotation_position: self.take_position(),
        };

        let mut pool = self.pool(provider).lock();
        self.store.upsert(&credential)?;
        let summary = CredentialSummary::from(&credential);
        pool.commit(credential);
        tracing::info!(provider = %provider, credential = %summary.id, capacity, "credential added");
        Ok(summary)
    }

    /// Delete a credential for good. Returns whether it existed.
    pub fn remove_credential(&self, id: &str) -> Result<bool> {
        for (&provider, pool) in &self.pools {
            let mut pool = pool.lock();
            if pool.get(id).is_some() {
                self.store.delete(id)?;
                pool.remove(id);
                tracing::info!(provider = %provider, credential = id, "credential removed");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Disable or re-enable a credential. Re-enabling a credential that is
    /// still over capacity puts it back into cooling.
    pub fn set_disabled(&self, id: &str, disabled: bool) -> Result<Option<CredentialSummary>> {
        for pool in self.pools.values() {
            let mut pool = pool.lock();
            let Some(current) = pool.get(id) else {
                continue;
            };

            let mut updated = current.clone();
            updated.status = if disabled {
                CredentialStatus::Disabled
            } else if updated.cumulative_units >= updated.capacity_per_cycle {
                CredentialStatus::Cooling
            } else {
                CredentialStatus::Active
            };
            if updated.status == current.status {
                return Ok(Some(CredentialSummary::from(current)));
            }

            self.store.upsert(&updated)?;
            let summary = CredentialSummary::from(&updated);
            pool.commit(updated);
            tracing::info!(credential = id, status = summary.status.as_str(), "credential status changed");
            return Ok(Some(summary));
        }
        Ok(None)
    }

    /// Summaries in rotation order, optionally for a single provider.
    pub fn list(&self, provider: Option<ProviderKind>) -> Vec<CredentialSummary> {
        ProviderKind::ALL
            .iter()
            .filter(|kind| provider.is_none_or(|p| p == **kind))
            .flat_map(|kind| {
                self.pool(*kind)
                    .lock()
                    .credentials()
                    .iter()
                    .map(CredentialSummary::from)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Reclaim cooled-down credentials across every provider.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut total = 0;
        for &kind in ProviderKind::ALL {
            let mut pool = self.pool(kind).lock();
            total += self.reclaim_locked(&mut pool, now)?;
        }
        Ok(total)
    }

    /// Add `secrets` for `provider` when it has no credentials at all.
    /// Returns how many were added.
    pub fn seed(
        &self,
        provider: ProviderKind,
        secrets: &[SecretString],
        capacity_per_cycle: Option<u64>,
    ) -> Result<usize> {
        if secrets.is_empty() || !self.pool(provider).lock().is_empty() {
            return Ok(0);
        }
        for secret in secrets {
            self.add_credential(provider, secret, capacity_per_cycle)?;
        }
        Ok(secrets.len())
    }

    pub fn health(&self) -> BTreeMap<ProviderKind, PoolHealth> {
        ProviderKind::ALL
            .iter()
            .map(|&kind| {
                let pool = self.pool(kind).lock();
                (
                    kind,
                    PoolHealth {
                        active: pool.count(CredentialStatus::Active),
                        cooling: pool.count(CredentialStatus::Cooling),
                        disabled: pool.count(CredentialStatus::Disabled),
                    },
                )
            })
            .collect()
    }
}
