//! Upstream AI provider adapters.
//!
//! The set of providers is closed: every upstream is a [`ProviderKind`]
//! variant, and each variant has exactly one [`ProviderAdapter`]. The
//! dispatcher only ever talks to the uniform `invoke` contract.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use crate::config::Config;
use crate::registry::ContentType;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Connect timeout for upstream HTTP clients. The overall call deadline is
/// enforced by the dispatcher.
const CONNECT_TIMEOUT_SECS: u64 = 10;

// ── Provider identity ────────────────────────────────────────────

/// Upstream AI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: &'static [ProviderKind] = &[
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}

// ── Adapter contract ─────────────────────────────────────────────

/// What the dispatcher hands to an adapter.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub input: String,
    pub content_type: ContentType,
}

/// What an adapter hands back on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutput {
    pub content: String,
    /// Input units reported by the provider, when it reports any.
    pub units_consumed: Option<u64>,
}

/// Failure raised by an adapter. The dispatcher scrubs the text before it
/// leaves the process.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Unsupported(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest includes the request URL in its message; drop it.
        Self::Transport(e.without_url().to_string())
    }
}

/// Uniform capability every upstream exposes.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn invoke(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Turn a non-success HTTP response into a [`ProviderError`].
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body: truncate(&body, 512),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

/// Build one adapter per provider from configuration.
pub fn build_adapters(
    config: &Config,
) -> anyhow::Result<HashMap<ProviderKind, Arc<dyn ProviderAdapter>>> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()?;

    let mut adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>> = HashMap::new();
    for &kind in ProviderKind::ALL {
        let base_url = config.provider(kind).base_url.clone();
        let adapter: Arc<dyn ProviderAdapter> = match kind {
            ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(client.clone(), base_url)),
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(client.clone(), base_url)),
            ProviderKind::Gemini => Arc::new(GeminiAdapter::new(client.clone(), base_url)),
        };
        adapters.insert(kind, adapter);
    }
    Ok(adapters)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter for exercising the dispatcher and the request flow.

    use super::*;
    use parking_lot::Mutex;
    use secrecy::ExposeSecret;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct ScriptedProvider {
        kind: ProviderKind,
        script: Mutex<VecDeque<Result<ProviderOutput, ProviderError>>>,
        delay: Option<Duration>,
        pub(crate) calls: AtomicUsize,
        credentials: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                script: Mutex::new(VecDeque::new()),
                delay: None,
                calls: AtomicUsize::new(0),
                credentials: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn push(&self, outcome: Result<ProviderOutput, ProviderError>) {
            self.script.lock().push_back(outcome);
        }

        pub(crate) fn credentials_seen(&self) -> Vec<String> {
            self.credentials.lock().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn invoke(
            &self,
            credential: &SecretString,
            request: &GenerationRequest,
        ) -> Result<ProviderOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.credentials
                .lock()
                .push(credential.expose_secret().to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(ProviderOutput {
                    content: format!("echo: {}", request.input),
                    units_consumed: None,
                })
            })
        }
    }
}
