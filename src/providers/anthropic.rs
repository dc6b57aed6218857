//! Anthropic Messages API adapter (text only).

use super::{error_for_status, GenerationRequest, ProviderAdapter, ProviderError, ProviderKind, ProviderOutput};
use crate::registry::ContentType;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
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
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn invoke(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        if request.content_type != ContentType::Text {
            return Err(ProviderError::Unsupported(format!(
                "anthropic adapter does not generate {} content",
                request.content_type
            )));
        }

        let body = json!({
            "model": request.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": request.input }],
        });
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", credential.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let parsed: MessagesResponse = error_for_status(response).await?.json().await?;

        let text: Vec<String> = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::Malformed("no text blocks in message".into()));
        }

        Ok(ProviderOutput {
            content: text.join(""),
            units_consumed: parsed.usage.map(|u| u.input_tokens),
        })
    }
}
