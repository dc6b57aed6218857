//! The single outbound call to a provider adapter.
//!
//! One call, one credential, one deadline. No retries and no fallback to a
//! different provider: a failure surfaces as a [`DispatchError`] naming the
//! provider, with the credential scrubbed from any provider text.

use crate::config::{Config, ProviderConfig};
use crate::providers::{GenerationRequest, ProviderAdapter, ProviderKind, ProviderOutput};
use crate::security::redact_secrets;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("{provider} did not answer within {}s", after.as_secs())]
    Timeout {
        provider: ProviderKind,
        after: Duration,
    },

    #[error("{provider} request failed: {message}")]
    Provider {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
    },
}

impl DispatchError {
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::Timeout { provider, .. } | Self::Provider { provider, .. } => *provider,
        }
    }
}

pub struct Dispatcher {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    timeouts: HashMap<ProviderKind, Duration>,
}

impl Dispatcher {
    pub fn new(
        adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
        timeouts: HashMap<ProviderKind, Duration>,
    ) -> Self {
        Self { adapters, timeouts }
    }

    /// Adapters plus the per-provider `timeout_secs` from configuration.
    pub fn from_config(
        config: &Config,
        adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let timeouts = ProviderKind::ALL
            .iter()
            .map(|&kind| (kind, Duration::from_secs(config.provider(kind).timeout_secs)))
            .collect();
        Self::new(adapters, timeouts)
    }

    pub fn timeout_for(&self, provider: ProviderKind) -> Duration {
        self.timeouts
            .get(&provider)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(ProviderConfig::default().timeout_secs))
    }

    pub async fn dispatch(
        &self,
        provider: ProviderKind,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, DispatchError> {
        let Some(adapter) = self.adapters.get(&provider) else {
            return Err(DispatchError::Provider {
                provider,
                status: None,
                message: "no adapter configured".into(),
            });
        };

        let deadline = self.timeout_for(provider);
        match tokio::time::timeout(deadline, adapter.invoke(credential, request)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                let message = redact_secrets(&e.to_string(), Some(credential.expose_secret()));
                tracing::warn!(
                    provider = %provider,
                    model = %request.model,
                    status = ?e.status(),
                    error = %message,
                    "provider call failed"
                );
                Err(DispatchError::Provider {
                    provider,
                    status: e.status(),
                    message,
                })
            }
            Err(_) => {
                tracing::warn!(
                    provider = %provider,
                    model = %request.model,
                    timeout_secs = deadline.as_secs(),
                    "provider call timed out"
                );
                Err(DispatchError::Timeout {
                    provider,
                    after: deadline,
                })
            }
        }
    }
}
