use crate::core::Settings;
use crate::errors::{RemixError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Messages in, text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, settings: &Settings, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat completion client.
pub struct ProviderClient {
    client: Client,
    temperature: f32,
    max_tokens: u32,
}

impl ProviderClient {
    pub fn new(temperature: f32, max_tokens: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            temperature,
            max_tokens,
        })
    }

    fn request_body(&self, settings: &Settings, messages: &[ChatMessage]) -> Value {
        json!({
            "model": settings.effective_model(),
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl ChatModel for ProviderClient {
    async fn complete(&self, settings: &Settings, messages: &[ChatMessage]) -> Result<String> {
        settings.validate()?;
        let base_url = settings.effective_base_url().ok_or_else(|| {
            RemixError::Configuration("no base URL for this provider".to_string())
        })?;
        let endpoint = format!("{base_url}{CHAT_COMPLETIONS_PATH}");
        debug!(
            "Calling {} with {} messages (model {})",
            endpoint,
            messages.len(),
            settings.effective_model()
        );

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(settings.api_key.trim())
            .json(&self.request_body(settings, messages))
            .send()
            .await
            .map_err(|e| RemixError::Provider(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemixError::Provider(format!("could not read response: {e}")))?;

        if !status.is_success() {
            let message = provider_error_message(&text)
                .unwrap_or_else(|| format!("Provider returned status {}", status.as_u16()));
            warn!("Provider error ({}): {}", status, message);
            return Err(RemixError::Provider(message));
        }

        extract_content(&text)
    }
}

/// `error.message` from a provider error body, when it has one.
pub fn provider_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .map(str::to_string)
        .filter(|m| !m.trim().is_empty())
}

/// Assistant text from a chat completion body.
pub fn extract_content(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| RemixError::Provider(format!("malformed response: {e}")))?;
    let content = value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(RemixError::Provider("the model returned an empty response".into()));
    }
    Ok(content.to_string())
}
