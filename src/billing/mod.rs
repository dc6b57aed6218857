//! Quota ledger: tenant balances, admission control and usage history.
//!
//! ## Design
//! - Balances and usage records live behind a [`LedgerStore`] (SQLite or
//!   in-memory)
//! - In-flight reservations and rate windows are in-memory, one mutex per
//!   tenant, created on demand
//! - Usage records are append-only; nothing updates or deletes them
//! - A balance only grows through [`QuotaLedger::grant_blocks`]

pub mod ledger;
pub mod rate_limiter;
pub mod store;

pub use ledger::{Admission, LedgerSettings, QuotaLedger, Reservation, Settlement};
pub use rate_limiter::{RatePolicy, RateWindow};
pub use store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};

use crate::providers::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who paid for the upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// The caller brought their own key.
    Caller,
    /// A pooled vault credential served the request.
    Vault,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Vault => "vault",
        }
    }
}

impl std::str::FromStr for CredentialSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(Self::Caller),
            "vault" => Ok(Self::Vault),
            other => anyhow::bail!("unknown credential source: {other}"),
        }
    }
}

/// One settled request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub tenant_id: String,
    pub model_id: String,
    pub units_consumed: u64,
    pub blocks_deducted: u64,
    pub credential_source: CredentialSource,
    pub provider: ProviderKind,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated usage over a time range, for reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub request_count: u64,
    pub total_blocks: u64,
    pub total_units: u64,
    pub by_provider: Vec<ProviderUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub provider: ProviderKind,
    pub request_count: u64,
    pub blocks: u64,
    pub units: u64,
}
