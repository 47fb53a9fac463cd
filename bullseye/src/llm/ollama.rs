use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{Credential, LlmAdapter, LlmError, LlmProvider, Prompt};

pub const OLLAMA_CLOUD_CHAT_URL: &str = "https://ollama.com/api/chat";

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Non-streaming chat client for one credential.
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    url: String,
    credential: Credential,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, credential: Credential) -> Self {
        Self {
            client,
            url: url.into(),
            credential,
        }
    }
}

#[async_trait]
impl LlmAdapter for OllamaClient {
    #[instrument(skip(self, prompt), fields(model = %prompt.model))]
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let body = json!({
            "model": prompt.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "stream": false,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = self.credential.token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Provider(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(500).collect();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(excerpt),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::InvalidCredential,
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => LlmError::Timeout,
                _ => LlmError::Provider(format!("HTTP {status}: {excerpt}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Provider(format!("invalid chat response: {e}")))?;
        let content = parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::Provider("chat response has no message".into()))?;
        debug!(length = content.len(), "chat response received");
        Ok(content)
    }
}

/// Hands out [`OllamaClient`]s that share one HTTP connection pool.
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
}

impl OllamaProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("bullseye")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl LlmProvider for OllamaProvider {
    fn connect(&self, credential: &Credential) -> Arc<dyn LlmAdapter> {
        Arc::new(OllamaClient::new(self.client.clone(), &self.url, credential.clone()))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
