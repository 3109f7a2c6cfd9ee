//! OpenAI-compatible LLM client.
//!
//! Works with any chat-completion endpoint. Transient transport failures are
//! retried with exponential backoff; rate limits back off with jitter; JSON
//! shape validation runs inside `complete_json` with its own bounded retries.

use crate::config::LlmConfig;
use crate::error::{FilingIndexError, Result};
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Shape-validation retry count, separate from transport retries.
const SHAPE_RETRIES: u32 = 3;

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
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

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// API error response body.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI-compatible LLM client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    /// Send a single chat completion request, no retries.
    async fn chat_once(&self, messages: &[Message]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.to_vec(),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| FilingIndexError::LlmApi(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FilingIndexError::LlmApi(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(FilingIndexError::LlmCapacity(format!(
                "Rate limited: {}",
                truncate(&body, 200)
            )));
        }

        if !status.is_success() {
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(FilingIndexError::LlmApi(format!(
                    "API error ({}): {}",
                    status, api_error.error.message
                )));
            }
            return Err(FilingIndexError::LlmApi(format!(
                "Request failed ({}): {}",
                status,
                truncate(&body, 200)
            )));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| FilingIndexError::LlmApi(format!("Malformed completion body: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| FilingIndexError::LlmApi("No choices in response".to_string()))
    }

    /// Send a chat completion, retrying transient failures with backoff.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<String> {
        let mut last_err = None;
        let retries = self.config.retries.max(1);

        for attempt in 0..retries {
            match self.chat_once(&messages).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_transient() => {
                    warn!("LLM call attempt {} failed: {}", attempt + 1, e);
                    let delay = backoff_delay(attempt, matches!(e, FilingIndexError::LlmCapacity(_)));
                    last_err = Some(e);
                    if attempt + 1 < retries {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FilingIndexError::LlmApi("retries exhausted".to_string())))
    }

    /// Convenience method: single user message with optional system prompt.
    pub async fn complete(&self, system: Option<&str>, user: &str) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(Message::system(sys));
        }
        messages.push(Message::user(user));
        self.chat(messages).await
    }

    /// Complete and parse the response against a declared JSON shape.
    ///
    /// Shape failures are retried up to 3 times with a fresh completion;
    /// a persistent failure surfaces as `LlmShape`, leaving the caller to
    /// decide whether to degrade or fail.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<T> {
        let mut last_err = String::new();

        for attempt in 0..SHAPE_RETRIES {
            let response = self.complete(system, user).await?;
            let json_str = extract_json(&response);

            match serde_json::from_str::<T>(&json_str) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "LLM response failed shape validation (attempt {}): {}",
                        attempt + 1,
                        e
                    );
                    last_err = format!("{}. Response: {}", e, truncate(&response, 200));
                }
            }
        }

        Err(FilingIndexError::LlmShape(last_err))
    }

    /// Test connectivity to the API.
    pub async fn test_connection(&self) -> Result<()> {
        let response = self
            .complete(None, "Say 'hello' and nothing else.")
            .await?;

        if response.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(FilingIndexError::LlmApi(format!(
                "Unexpected response: {}",
                response
            )))
        }
    }
}

/// Exponential backoff; capacity errors get random jitter on top.
fn backoff_delay(attempt: u32, jitter: bool) -> Duration {
    let base_ms = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter_ms = if jitter {
        rand::thread_rng().gen_range(0..base_ms.max(1))
    } else {
        0
    };
    Duration::from_millis(base_ms + jitter_ms)
}

/// Extract JSON from a potentially markdown-wrapped response.
pub fn extract_json(response: &str) -> String {
    let response = response.trim();

    if response.starts_with("```json") {
        if let Some(end) = response.rfind("```") {
            let start = "```json".len();
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    if response.starts_with("```") {
        if let Some(end) = response.rfind("```") {
            let start = response.find('\n').map(|n| n + 1).unwrap_or(3);
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    if let Some(start) = response.find('[') {
        if let Some(end) = response.rfind(']') {
            // Prefer an object when it encloses the array
            let obj_start = response.find('{');
            if obj_start.map_or(true, |o| o > start) && end > start {
                return response[start..=end].to_string();
            }
        }
    }

    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return response[start..=end].to_string();
            }
        }
    }

    response.to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
