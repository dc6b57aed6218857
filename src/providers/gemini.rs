//! Google Gemini `generateContent` adapter (text only).
//!
//! The key travels in the `x-goog-api-key` header rather than the query
//! string so it never ends up in a URL.

use super::{error_for_status, GenerationRequest, ProviderAdapter, ProviderError, ProviderKind, ProviderOutput};
use crate::registry::ContentType;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: u64,
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn invoke(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        if request.content_type != ContentType::Text {
            return Err(ProviderError::Unsupported(format!(
                "gemini adapter does not generate {} content",
                request.content_type
            )));
        }

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.input }] }],
        });
        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, request.model
            ))
            .header("x-goog-api-key", credential.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: GenerateResponse = error_for_status(response).await?.json().await?;

        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ProviderError::Malformed("no candidate text".into()));
        }

        Ok(ProviderOutput {
            content,
            units_consumed: parsed.usage_metadata.map(|u| u.prompt_token_count),
        })
    }
}
