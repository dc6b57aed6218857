//! OpenAI adapter: chat completions for text, image generations for images.

use super::{error_for_status, GenerationRequest, ProviderAdapter, ProviderError, ProviderKind, ProviderOutput};
use crate::registry::ContentType;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn chat(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        let body = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.input }],
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(credential.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: ChatResponse = error_for_status(response).await?.json().await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("no choices in completion".into()))?;

        Ok(ProviderOutput {
            content,
            units_consumed: parsed.usage.map(|u| u.prompt_tokens),
        })
    }

    async fn image(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        let body = json!({
            "model": request.model,
            "prompt": request.input,
            "n": 1,
        });
        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(credential.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: ImageResponse = error_for_status(response).await?.json().await?;

        let image = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("no image in response".into()))?;
        let content = image
            .url
            .or_else(|| image.b64_json.map(|b64| format!("data:image/png;base64,{b64}")))
            .ok_or_else(|| ProviderError::Malformed("image has neither url nor data".into()))?;

        Ok(ProviderOutput {
            content,
            units_consumed: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn invoke(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        match request.content_type {
            ContentType::Text => self.chat(credential, request).await,
            ContentType::Image => self.image(credential, request).await,
            other => Err(ProviderError::Unsupported(format!(
                "openai adapter does not generate {other} content"
            ))),
        }
    }
}
