//! Request orchestration.
//!
//! ## Flow
//! 1. Validate the request and look the model up in the registry
//! 2. Resolve the processing strategy
//! 3. Admission control on the quota ledger (reserves the estimated cost)
//! 4. Pick the credential: the caller's own, or one leased from the vault
//! 5. One outbound call through the dispatcher
//! 6. Settle the ledger, then report usage to the vault
//!
//! Steps 1-4 mutate nothing on failure. A dispatch failure releases the
//! reservation without billing or counting vault usage.

pub mod accounting;

pub use accounting::{estimate_units, units_consumed};

use crate::billing::{
    Admission, CredentialSource, LedgerSettings, QuotaLedger, SqliteLedgerStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{RateLimitInfo, ShotCallerError};
use crate::providers::{GenerationRequest, ProviderAdapter, ProviderKind};
use crate::registry::{ContentType, ModelRegistry};
use crate::security::AesEncryptor;
use crate::strategy::{self, PricingTable};
use crate::vault::{CredentialVault, SqliteVaultStore, VaultSettings};
use accounting::Accounting;
use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Inbound generation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    pub tenant_id: String,
    pub model_id: String,
    pub input: String,
    #[serde(default)]
    pub caller_supplies_own_credential: bool,
    #[serde(default)]
    pub caller_credential: Option<SecretString>,
    #[serde(default)]
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub success: bool,
    pub content: String,
    pub model_used: String,
    pub provider_used: ProviderKind,
    pub processing_time_ms: u64,
    pub units_consumed: u64,
    pub blocks_deducted: u64,
    pub remaining_balance: u64,
    pub credential_source: CredentialSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub success: bool,
    pub error: String,
    pub error_kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

impl From<&ShotCallerError> for FailureResponse {
    fn from(err: &ShotCallerError) -> Self {
        let error = match err {
            // Storage detail stays in the logs.
            ShotCallerError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let rate_limit = match err {
            ShotCallerError::AdmissionDenied(denial) => denial.rate_limit().cloned(),
            _ => None,
        };
        Self {
            success: false,
            error,
            error_kind: err.kind(),
            rate_limit,
        }
    }
}

pub struct ShotCaller {
    registry: ModelRegistry,
    pricing: PricingTable,
    ledger: QuotaLedger,
    vault: CredentialVault,
    dispatcher: Dispatcher,
}

impl ShotCaller {
    pub fn new(
        registry: ModelRegistry,
        pricing: PricingTable,
        ledger: QuotaLedger,
        vault: CredentialVault,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            registry,
            pricing,
            ledger,
            vault,
            dispatcher,
        }
    }

    /// Wire everything from configuration: SQLite stores under `data_dir`,
    /// the vault master key, and the configured provider keys seeded into
    /// empty pools.
    pub fn open(
        config: &Config,
        adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    ) -> anyhow::Result<Self> {
        let registry = ModelRegistry::from_models(config.catalog())?;
        let pricing = config.pricing.table()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ledger_store = SqliteLedgerStore::open(&config.ledger_db_path())
            .context("Failed to open ledger store")?;
        let ledger = QuotaLedger::new(
            Arc::new(ledger_store),
            Arc::clone(&clock),
            LedgerSettings::from(&config.ledger),
        );

        let encryptor = AesEncryptor::load_or_generate(&config.vault_key_path())?;
        let vault_store = SqliteVaultStore::open(&config.vault_db_path())
            .context("Failed to open vault store")?;
        let vault = CredentialVault::open(
            Arc::new(vault_store),
            encryptor,
            clock,
            VaultSettings::from(&config.vault),
        )?;
        for &kind in ProviderKind::ALL {
            let provider = config.provider(kind);
            let seeded = vault.seed(kind, &provider.api_keys, provider.capacity_per_cycle)?;
            if seeded > 0 {
                tracing::info!(provider = %kind, count = seeded, "seeded vault from config");
            }
        }

        let dispatcher = Dispatcher::from_config(config, adapters);
        Ok(Self::new(registry, pricing, ledger, vault, dispatcher))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    fn validate(request: &InboundRequest) -> Result<(), ShotCallerError> {
        if request.tenant_id.trim().is_empty() {
            return Err(ShotCallerError::InvalidRequest("tenantId must not be empty".into()));
        }
        if request.input.trim().is_empty() {
            return Err(ShotCallerError::InvalidRequest("input must not be empty".into()));
        }
        if request.caller_supplies_own_credential
            && request
                .caller_credential
                .as_ref()
                .is_none_or(|c| c.expose_secret().trim().is_empty())
        {
            return Err(ShotCallerError::InvalidRequest(
                "callerCredential is required when callerSuppliesOwnCredential is set".into(),
            ));
        }
        Ok(())
    }

    /// Serve one generation request end to end.
    pub async fn handle(
        &self,
        request: InboundRequest,
    ) -> Result<GenerationResponse, ShotCallerError> {
        let started = Instant::now();
        Self::validate(&request)?;

        let model = self
            .registry
            .lookup(&request.model_id)
            .ok_or_else(|| ShotCallerError::UnknownModel(request.model_id.clone()))?;
        let strategy = strategy::resolve(
            &self.registry,
            &model.id,
            request.caller_supplies_own_credential,
            request.content_type,
            &self.pricing,
        )?;
        let estimated = estimate_units(&request.input);

        let reservation =
            match self
                .ledger
                .check_and_reserve(&request.tenant_id, &strategy, estimated)?
            {
                Admission::Allow(reservation) => reservation,
                Admission::Deny(denial) => return Err(ShotCallerError::AdmissionDenied(denial)),
            };

        let (credential, lease) = if strategy.uses_caller_credential {
            let credential = request
                .caller_credential
                .clone()
                .ok_or_else(|| ShotCallerError::InvalidRequest("callerCredential missing".into()))?;
            (credential, None)
        } else {
            let lease = self
                .vault
                .select(model.provider, estimated)?
                .ok_or(ShotCallerError::CredentialUnavailable {
                    provider: model.provider,
                })?;
            (self.vault.reveal(&lease)?, Some(lease))
        };

        let outbound = GenerationRequest {
            model: model.id.clone(),
            input: request.input,
            content_type: request.content_type,
        };
        let output = self
            .dispatcher
            .dispatch(model.provider, &credential, &outbound)
            .await?;
        drop(credential);

        let units = units_consumed(output.units_consumed, estimated);
        let settlement = Accounting {
            ledger: &self.ledger,
            vault: &self.vault,
        }
        .record(reservation, lease.as_ref(), &model.id, model.provider, units)?;

        Ok(GenerationResponse {
            success: true,
            content: output.content,
            model_used: model.id.clone(),
            provider_used: model.provider,
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            units_consumed: units,
            blocks_deducted: settlement.blocks_deducted,
            remaining_balance: settlement.remaining_balance,
            credential_source: settlement.record.credential_source,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::harness::{byok, harness, request};
    use super::*;
    use crate::providers::{ProviderError, ProviderOutput};
    use crate::vault::CredentialStatus;

    #[tokio::test]
    async fn heavy_request_with_vault_credential() {
        let h = harness();
        h.shotcaller
            .vault()
            .add_credential(ProviderKind::OpenAi, &SecretString::from("sk-pool-1"), Some(1000))
            .unwrap();

        let response = h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.provider_used, ProviderKind::OpenAi);
        assert_eq!(response.blocks_deducted, 2);
        assert_eq!(response.remaining_balance, 8);
        assert_eq!(response.credential_source, CredentialSource::Vault);
        assert_eq!(
            h.providers[&ProviderKind::OpenAi].credentials_seen(),
            vec!["sk-pool-1".to_string()]
        );

        let listed = h.shotcaller.vault().list(Some(ProviderKind::OpenAi));
        assert_eq!(listed[0].cumulative_units, response.units_consumed);
    }

    #[tokio::test]
    async fn fast_byok_is_free_and_skips_the_vault() {
        let h = harness();
        let response = h
            .shotcaller
            .handle(byok(request("u1", "gpt-4o-mini"), "sk-caller-own"))
            .await
            .unwrap();
        assert_eq!(response.blocks_deducted, 0);
        assert_eq!(response.remaining_balance, 10);
        assert_eq!(response.credential_source, CredentialSource::Caller);
        assert_eq!(
            h.providers[&ProviderKind::OpenAi].credentials_seen(),
            vec!["sk-caller-own".to_string()]
        );
    }

    #[tokio::test]
    async fn fast_metered_bills_per_thousand_reported_units() {
        let h = harness();
        h.shotcaller
            .vault()
            .add_credential(ProviderKind::Gemini, &SecretString::from("AIza-pool"), None)
            .unwrap();
        h.providers[&ProviderKind::Gemini].push(Ok(ProviderOutput {
            content: "ok".into(),
            units_consumed: Some(2500),
        }));

        let response = h
            .shotcaller
            .handle(request("u1", "gemini-2.5-flash"))
            .await
            .unwrap();
        assert_eq!(response.units_consumed, 2500);
        assert_eq!(response.blocks_deducted, 3);
        assert_eq!(response.remaining_balance, 7);
    }

    #[tokio::test]
    async fn dispatch_failure_bills_nothing() {
        let h = harness();
        h.shotcaller
            .vault()
            .add_credential(ProviderKind::Anthropic, &SecretString::from("sk-ant-pool"), None)
            .unwrap();
        h.providers[&ProviderKind::Anthropic].push(Err(ProviderError::Status {
            status: 529,
            body: "overloaded".into(),
        }));

        let err = h
            .shotcaller
            .handle(request("u1", "claude-opus-4-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dispatch_error");
        assert_eq!(h.shotcaller.ledger().balance("u1").unwrap(), 10);
        assert_eq!(h.shotcaller.ledger().reserved("u1"), 0);
        assert!(h.shotcaller.ledger().usage("u1", 10).unwrap().is_empty());
        let listed = h.shotcaller.vault().list(Some(ProviderKind::Anthropic));
        assert_eq!(listed[0].cumulative_units, 0);
        assert!(listed[0].last_used_at.is_none());
    }

    #[tokio::test]
    async fn empty_pool_is_credential_unavailable() {
        let h = harness();
        let err = h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap_err();
        assert!(matches!(
            err,
            ShotCallerError::CredentialUnavailable {
                provider: ProviderKind::OpenAi
            }
        ));
        assert_eq!(h.shotcaller.ledger().reserved("u1"), 0);
        assert_eq!(h.providers[&ProviderKind::OpenAi].call_count(), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_anything_else() {
        let h = harness();

        let err = h.shotcaller.handle(request("u1", "gpt-9")).await.unwrap_err();
        assert!(matches!(err, ShotCallerError::UnknownModel(_)));

        let mut empty = request("u1", "gpt-4.1");
        empty.input = "   ".into();
        let err = h.shotcaller.handle(empty).await.unwrap_err();
        assert!(err.is_validation());

        let mut missing_key = request("u1", "gpt-4o-mini");
        missing_key.caller_supplies_own_credential = true;
        let err = h.shotcaller.handle(missing_key).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        assert_eq!(h.shotcaller.ledger().tracked_tenants(), 0);
    }

    #[tokio::test]
    async fn rotation_moves_exhausted_credential_to_back() {
        let h = harness();
        let vault = h.shotcaller.vault();
        let a = vault
            .add_credential(ProviderKind::OpenAi, &SecretString::from("sk-a"), Some(10))
            .unwrap();
        vault
            .add_credential(ProviderKind::OpenAi, &SecretString::from("sk-b"), Some(10))
            .unwrap();
        h.providers[&ProviderKind::OpenAi].push(Ok(ProviderOutput {
            content: "ok".into(),
            units_consumed: Some(10),
        }));

        h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        let listed = vault.list(Some(ProviderKind::OpenAi));
        assert_eq!(listed[1].id, a.id);
        assert_eq!(listed[1].status, CredentialStatus::Cooling);

        h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        assert_eq!(
            h.providers[&ProviderKind::OpenAi].credentials_seen(),
            vec!["sk-a".to_string(), "sk-b".to_string()]
        );
    }

    #[tokio::test]
    async fn rate_window_reopens_after_it_elapses() {
        use super::harness::harness_with;
        use crate::billing::RatePolicy;
        use std::time::Duration;

        let h = harness_with(
            LedgerSettings {
                starting_grant: 100,
                rate: RatePolicy::new(2, 60),
            },
            VaultSettings::default(),
            Duration::from_secs(5),
        );
        h.shotcaller
            .vault()
            .add_credential(ProviderKind::OpenAi, &SecretString::from("sk-1"), None)
            .unwrap();

        h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        let err = h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(h.shotcaller.ledger().balance("u1").unwrap(), 96);

        h.clock.advance(chrono::Duration::seconds(61));
        let response = h.shotcaller.handle(request("u1", "gpt-4.1")).await.unwrap();
        assert_eq!(response.remaining_balance, 94);
    }

    #[test]
    fn failure_response_carries_rate_limit_and_hides_storage_detail() {
        let denial = crate::error::Denial::RateLimited(RateLimitInfo {
            limit: 1,
            remaining: 0,
            reset_at: chrono::Utc::now(),
            retry_after_secs: 12,
        });
        let body = FailureResponse::from(&ShotCallerError::AdmissionDenied(denial));
        assert!(!body.success);
        assert_eq!(body.error_kind, "rate_limited");
        assert_eq!(body.rate_limit.map(|r| r.retry_after_secs), Some(12));

        let body = FailureResponse::from(&ShotCallerError::Storage(anyhow::anyhow!(
            "disk I/O error at /var/lib/shotcaller/ledger.db"
        )));
        assert_eq!(body.error, "internal error");
        assert_eq!(body.error_kind, "storage_error");
    }

    #[test]
    fn inbound_request_defaults() {
        let request: InboundRequest = serde_json::from_str(
            r#"{"tenantId":"u1","modelId":"gpt-4.1","input":"hi"}"#,
        )
        .unwrap();
        assert!(!request.caller_supplies_own_credential);
        assert!(request.caller_credential.is_none());
        assert_eq!(request.content_type, ContentType::Text);
    }
}
