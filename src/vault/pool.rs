//! Per-provider credential pool and the selection rule.
//!
//! Everything in this file is pure bookkeeping over an ordered list; the
//! vault wraps it in a lock and persists the changes it returns.

use crate::providers::ProviderKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Cooling,
    Disabled,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooling => "cooling",
            Self::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for CredentialStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cooling" => Ok(Self::Cooling),
            "disabled" => Ok(Self::Disabled),
            other => anyhow::bail!("unknown credential status: {other}"),
        }
    }
}

/// One upstream key as the vault stores it. The secret is only ever held
/// encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultCredential {
    pub id: String,
    pub provider: ProviderKind,
    pub(super) encrypted_secret: String,
    pub cumulative_units: u64,
    pub status: CredentialStatus,
    pub capacity_per_cycle: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Lower serves first.
    pub rotation_position: u64,
}

impl VaultCredential {
    pub fn headroom(&self) -> u64 {
        self.capacity_per_cycle
            .saturating_sub(self.cumulative_units)
    }

    pub(crate) fn encrypted_secret(&self) -> &str {
        &self.encrypted_secret
    }

    /// Cooling long enough to start a new cycle?
    pub fn is_reclaimable(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.status == CredentialStatus::Cooling
            && self
                .last_used_at
                .is_none_or(|last| now - last >= cooldown)
    }
}

impl std::fmt::Debug for VaultCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCredential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("encrypted_secret", &"[REDACTED]")
            .field("cumulative_units", &self.cumulative_units)
            .field("status", &self.status)
            .field("capacity_per_cycle", &self.capacity_per_cycle)
            .field("last_used_at", &self.last_used_at)
            .field("rotation_position", &self.rotation_position)
            .finish()
    }
}

/// Outcome of recording usage against a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Still under capacity.
    Counted,
    /// Reached capacity; now cooling at the back of the rotation.
    Exhausted,
}

/// Credentials of a single provider, kept in rotation order.
#[derive(Debug, Default)]
pub struct ProviderPool {
    credentials: Vec<VaultCredential>,
}

impl ProviderPool {
    pub fn new(mut credentials: Vec<VaultCredential>) -> Self {
        credentials.sort_by_key(|c| c.rotation_position);
        Self { credentials }
    }

    pub fn credentials(&self) -> &[VaultCredential] {
        &self.credentials
    }

    pub fn get(&self, id: &str) -> Option<&VaultCredential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn count(&self, status: CredentialStatus) -> usize {
        self.credentials.iter().filter(|c| c.status == status).count()
    }

    /// Cooling credentials whose cooldown has elapsed, already reset to a
    /// fresh active cycle. Nothing in the pool changes until `commit`.
    pub fn reclaimable(&self, now: DateTime<Utc>, cooldown: Duration) -> Vec<VaultCredential> {
        self.credentials
            .iter()
            .filter(|c| c.is_reclaimable(now, cooldown))
            .map(|c| {
                let mut reclaimed = c.clone();
                reclaimed.status = CredentialStatus::Active;
                reclaimed.cumulative_units = 0;
                reclaimed
            })
            .collect()
    }

    /// Best fit among active credentials: the smallest headroom that still
    /// covers `estimated_units`. When nothing covers it, the active
    /// credential with the most headroom. Ties go to the earlier position.
    pub fn select(&self, estimated_units: u64) -> Option<&VaultCredential> {
        let mut best_fit: Option<(&VaultCredential, u64)> = None;
        let mut roomiest: Option<(&VaultCredential, u64)> = None;

        for credential in self
            .credentials
            .iter()
            .filter(|c| c.status == CredentialStatus::Active)
        {
            let headroom = credential.headroom();
            if headroom >= estimated_units && best_fit.is_none_or(|(_, best)| headroom < best) {
                best_fit = Some((credential, headroom));
            }
            if roomiest.is_none_or(|(_, most)| headroom > most) {
                roomiest = Some((credential, headroom));
            }
        }

        best_fit.or(roomiest).map(|(credential, _)| credential)
    }

    /// Updated copy of credential `id` after `units` more usage. `back_of_line`
    /// is the rotation position it takes if this pushes it into cooling.
    pub fn with_usage(
        &self,
        id: &str,
        units: u64,
        now: DateTime<Utc>,
        back_of_line: u64,
    ) -> Option<(VaultCredential, UsageOutcome)> {
        let mut updated = self.get(id)?.clone();
        updated.cumulative_units = updated.cumulative_units.saturating_add(units);
        updated.last_used_at = Some(now);

        let reached_capacity = updated.cumulative_units >= updated.capacity_per_cycle;
        if reached_capacity && updated.status == CredentialStatus::Active {
            updated.status = CredentialStatus::Cooling;
            updated.rotation_position = back_of_line;
            return Some((updated, UsageOutcome::Exhausted));
        }
        Some((updated, UsageOutcome::Counted))
    }

    /// Replace or insert a credential and restore rotation order.
    pub fn commit(&mut self, credential: VaultCredential) {
        match self.credentials.iter_mut().find(|c| c.id == credential.id) {
            Some(slot) => *slot = credential,
            None => self.credentials.push(credential),
        }
        self.credentials.sort_by_key(|c| c.rotation_position);
    }

    pub fn remove(&mut self, id: &str) -> Option<VaultCredential> {
        let index = self.credentials.iter().position(|c| c.id == id)?;
        Some(self.credentials.remove(index))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn credential(id: &str, position: u64, capacity: u64, used: u64) -> VaultCredential {
        VaultCredential {
            id: id.into(),
            provider: ProviderKind::OpenAi,
            encrypted_secret: format!("aes256:{id}"),
            cumulative_units: used,
            status: CredentialStatus::Active,
            capacity_per_cycle: capacity,
            last_used_at: None,
            created_at: Utc::now(),
            rotation_position: position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::credential;
    use super::*;

    #[test]
    fn best_fit_prefers_smallest_sufficient_headroom() {
        let pool = ProviderPool::new(vec![
            credential("roomy", 0, 1000, 0),
            credential("snug", 1, 1000, 700),
            credential("tight", 2, 1000, 950),
        ]);
        assert_eq!(pool.select(200).map(|c| c.id.as_str()), Some("snug"));
        assert_eq!(pool.select(50).map(|c| c.id.as_str()), Some("tight"));
    }

    #[test]
    fn ties_go_to_rotation_order() {
        let pool = ProviderPool::new(vec![
            credential("b", 1, 1000, 0),
            credential("a", 0, 1000, 0),
        ]);
        assert_eq!(pool.select(200).map(|c| c.id.as_str()), Some("a"));
        assert_eq!(pool.select(5000).map(|c| c.id.as_str()), Some("a"));
    }

    #[test]
    fn fails_open_to_most_headroom() {
        let pool = ProviderPool::new(vec![
            credential("a", 0, 1000, 900),
            credential("b", 1, 1000, 600),
        ]);
        assert_eq!(pool.select(5000).map(|c| c.id.as_str()), Some("b"));
    }

    #[test]
    fn skips_cooling_and_disabled() {
        let mut cooling = credential("cooling", 0, 1000, 1000);
        cooling.status = CredentialStatus::Cooling;
        let mut disabled = credential("disabled", 1, 1000, 0);
        disabled.status = CredentialStatus::Disabled;
        let pool = ProviderPool::new(vec![cooling, disabled.clone()]);
        assert!(pool.select(1).is_none());

        let pool = ProviderPool::new(vec![disabled, credential("live", 2, 10, 0)]);
        assert_eq!(pool.select(1).map(|c| c.id.as_str()), Some("live"));
    }

    #[test]
    fn selection_is_deterministic() {
        let pool = ProviderPool::new(vec![
            credential("a", 0, 500, 100),
            credential("b", 1, 500, 100),
            credential("c", 2, 800, 0),
        ]);
        let first = pool.select(300).map(|c| c.id.clone());
        for _ in 0..10 {
            assert_eq!(pool.select(300).map(|c| c.id.clone()), first);
        }
    }

    #[test]
    fn reaching_capacity_moves_to_back_and_cools() {
        let mut pool = ProviderPool::new(vec![
            credential("a", 0, 1000, 800),
            credential("b", 1, 1000, 0),
        ]);
        let now = Utc::now();
        let (updated, outcome) = pool.with_usage("a", 200, now, 2).unwrap();
        assert_eq!(outcome, UsageOutcome::Exhausted);
        assert_eq!(updated.status, CredentialStatus::Cooling);
        assert_eq!(updated.last_used_at, Some(now));

        pool.commit(updated);
        let order: Vec<&str> = pool.credentials().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn usage_below_capacity_keeps_position() {
        let pool = ProviderPool::new(vec![credential("a", 0, 1000, 0)]);
        let (updated, outcome) = pool.with_usage("a", 999, Utc::now(), 9).unwrap();
        assert_eq!(outcome, UsageOutcome::Counted);
        assert_eq!(updated.status, CredentialStatus::Active);
        assert_eq!(updated.rotation_position, 0);
        assert!(pool.with_usage("missing", 1, Utc::now(), 9).is_none());
    }

    #[test]
    fn disabled_credential_stays_disabled_when_usage_lands() {
        let mut c = credential("a", 0, 100, 90);
        c.status = CredentialStatus::Disabled;
        let pool = ProviderPool::new(vec![c]);
        let (updated, _) = pool.with_usage("a", 50, Utc::now(), 5).unwrap();
        assert_eq!(updated.status, CredentialStatus::Disabled);
        assert_eq!(updated.cumulative_units, 140);
    }

    #[test]
    fn reclaim_waits_for_cooldown() {
        let start = Utc::now();
        let mut c = credential("a", 0, 1000, 1000);
        c.status = CredentialStatus::Cooling;
        c.last_used_at = Some(start);
        let pool = ProviderPool::new(vec![c]);
        let cooldown = Duration::hours(1);

        assert!(pool
            .reclaimable(start + Duration::minutes(59), cooldown)
            .is_empty());
        let reclaimed = pool.reclaimable(start + Duration::hours(1), cooldown);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, CredentialStatus::Active);
        assert_eq!(reclaimed[0].cumulative_units, 0);
        assert_eq!(pool.count(CredentialStatus::Cooling), 1);
    }

    #[test]
    fn debug_never_shows_ciphertext() {
        let rendered = format!("{:?}", credential("a", 0, 10, 0));
        assert!(!rendered.contains("aes256:"));
    }

    #[test]
    fn status_parses_from_str() {
        for status in [
            CredentialStatus::Active,
            CredentialStatus::Cooling,
            CredentialStatus::Disabled,
        ] {
            assert_eq!(status.as_str().parse::<CredentialStatus>().unwrap(), status);
        }
    }
}
