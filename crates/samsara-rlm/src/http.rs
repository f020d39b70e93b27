//! OpenAI-compatible HTTP planner client.
//!
//! Works against any `/chat/completions`-style endpoint (OpenAI, Groq,
//! Ollama, vLLM). Token usage is taken from the response's `usage` block.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;

use crate::client::{ChatMessage, ChatResponse, LlmClient, with_retry};
use crate::error::{Result, RlmError};

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Configuration for the OpenAI-compatible client.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Base URL for the API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Model identifier sent with every request.
    pub model: String,

    /// Bearer token, if the endpoint requires one.
    pub api_key: Option<String>,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum retries for transient errors.
    pub max_retries: u32,

    /// Initial backoff duration for retries.
    pub retry_backoff: Duration,
}

impl OpenAiCompatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CompletionsReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: UsageBlock,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageBlock {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible planner backend.
pub struct OpenAiCompatClient {
    config: OpenAiCompatConfig,
    client: Client,
    name: String,
}

impl OpenAiCompatClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref key) = config.api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| RlmError::Config(format!("invalid API key: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RlmError::Config(format!("failed to build HTTP client: {e}")))?;

        let name = format!("openai-compat({})", config.model);
        Ok(Self {
            config,
            client,
            name,
        })
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
        });

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // 5xx and rate limits are worth retrying; the rest are not.
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(RlmError::Network(format!("HTTP {status}: {text}")));
            }
            return Err(RlmError::Planner(format!("HTTP {status}: {text}")));
        }

        let reply: CompletionsReply = response.json().await?;
        let content = reply
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| RlmError::Planner("response contained no choices".to_string()))?;

        Ok(ChatResponse::new(
            content,
            reply.usage.prompt_tokens,
            reply.usage.completion_tokens,
        ))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.name,
            || self.complete_once(messages),
        )
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = OpenAiCompatConfig::new("https://api.example.com/v1", "test-model")
            .with_api_key("sk-test")
            .with_timeout(Duration::from_secs(30))
            .with_max_retries(1);

        assert_eq!(config.base_url, "https://api.example.com/v1");
        assert_eq!(config.model, "test-model");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_client_name_includes_model() {
        let client =
            OpenAiCompatClient::new(OpenAiCompatConfig::new("http://localhost:1", "m1")).unwrap();
        assert_eq!(client.name(), "openai-compat(m1)");
    }

    #[test]
    fn test_reply_parsing() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let reply: CompletionsReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.choices[0].message.content, "hello");
        assert_eq!(reply.usage.prompt_tokens, 10);
    }

    #[test]
    fn test_reply_parsing_without_usage() {
        let json = r#"{"choices": [{"message": {"content": "x"}}]}"#;
        let reply: CompletionsReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.usage.prompt_tokens, 0);
    }
}
