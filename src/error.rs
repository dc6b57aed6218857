//! Error taxonomy for the request flow.
//!
//! Every failure a caller can see is one of these variants. Each variant
//! maps to exactly one HTTP status in the gateway, and none of them carries
//! secret material.

use crate::dispatch::DispatchError;
use crate::providers::ProviderKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rate-limit metadata returned with a `rate limited` denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

/// Why the ledger refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    InsufficientBalance { required: u64, available: u64 },
    RateLimited(RateLimitInfo),
}

impl Denial {
    /// Machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient balance",
            Self::RateLimited(_) => "rate limited",
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::RateLimited(info) => Some(info),
            Self::InsufficientBalance { .. } => None,
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: {required} blocks required, {available} available"
            ),
            Self::RateLimited(info) => write!(
                f,
                "rate limited: retry after {}s",
                info.retry_after_secs
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShotCallerError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    AdmissionDenied(Denial),

    #[error("no active credential for provider {provider}")]
    CredentialUnavailable { provider: ProviderKind },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ShotCallerError {
    /// Stable kind string used in failure responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AdmissionDenied(Denial::InsufficientBalance { .. }) => "insufficient_balance",
            Self::AdmissionDenied(Denial::RateLimited(_)) => "rate_limited",
            Self::CredentialUnavailable { .. } => "credential_unavailable",
            Self::Dispatch(DispatchError::Timeout { .. }) => "dispatch_timeout",
            Self::Dispatch(DispatchError::Provider { .. }) => "dispatch_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// True for failures raised before anything was mutated.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UnknownModel(_) | Self::InvalidRequest(_))
    }
}
