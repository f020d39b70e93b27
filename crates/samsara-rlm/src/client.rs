//! Planner LLM client abstraction.
//!
//! The engine talks to the planner (and to sub-LLMs, which are the same
//! model behind a different prompt scaffold) through [`LlmClient`]. The
//! bundled [`MockLlmClient`] returns scripted responses in order for
//! deterministic engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RlmError};

/// The author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Assistant,
    User,
}

/// One turn of planner conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A completed planner call with its token accounting.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl ChatResponse {
    pub fn new(content: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            content: content.into(),
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Trait for planner LLM providers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute a completion over the full message sequence (a leading
    /// system message is permitted).
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatResponse>;

    /// Name of this client for logs.
    fn name(&self) -> &str;
}

/// A client that can be shared across threads.
pub type SharedLlmClient = Arc<dyn LlmClient>;

/// Execute an async operation with exponential backoff retry.
///
/// Retries only transient network errors; everything else returns
/// immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    client_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                last_error = Some(e);
                if attempt < max_retries {
                    tracing::warn!(
                        client = client_name,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap())
}

/// Check if an error is retryable. Only network errors qualify.
pub fn is_retryable(error: &RlmError) -> bool {
    matches!(error, RlmError::Network(_))
}

/// A mock planner for testing.
///
/// Returns pre-configured responses in order and logs every request. One
/// more request than responses available is an error.
#[derive(Debug)]
pub struct MockLlmClient {
    name: String,
    responses: Mutex<VecDeque<ChatResponse>>,
    request_log: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: Mutex::new(responses.into()),
            request_log: Mutex::new(Vec::new()),
        }
    }

    /// A mock that answers each call with the next text, charging 100
    /// prompt and 50 completion tokens per call.
    pub fn with_texts(texts: Vec<&str>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| ChatResponse::new(t, 100, 50))
                .collect(),
        )
    }

    /// All requests made so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.request_log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        self.request_log.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RlmError::Planner("MockLlmClient: no more responses".to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_responses_in_order() {
        let client = MockLlmClient::with_texts(vec!["first", "second"]);

        let r1 = client.complete(&[ChatMessage::user("a")]).await.unwrap();
        let r2 = client.complete(&[ChatMessage::user("b")]).await.unwrap();
        assert_eq!(r1.content, "first");
        assert_eq!(r2.content, "second");
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_exhausted_errors() {
        let client = MockLlmClient::new(vec![]);
        let result = client.complete(&[ChatMessage::user("x")]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_logs_requests() {
        let client = MockLlmClient::with_texts(vec!["r"]);
        client
            .complete(&[ChatMessage::system("s"), ChatMessage::user("q")])
            .await
            .unwrap();

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 2);
        assert_eq!(requests[0][0].role, Role::System);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_non_retryable() {
        let mut calls = 0;
        let result: Result<()> = with_retry(3, Duration::from_millis(1), "test", || {
            calls += 1;
            async { Err(RlmError::Config("bad".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_network_errors() {
        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = calls.clone();
        let result: Result<u32> = with_retry(2, Duration::from_millis(10), "test", move || {
            let calls = calls_clone.clone();
            async move {
                let mut n = calls.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err(RlmError::Network("flaky".to_string()))
                } else {
                    Ok(*n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_chat_response_total() {
        let response = ChatResponse::new("x", 100, 50);
        assert_eq!(response.total_tokens(), 150);
    }
}
