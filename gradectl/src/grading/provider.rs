//! Model provider abstraction for grading calls.
//!
//! This module defines the `GraderClient` trait to abstract the chat
//! completion call made for each ensemble run, enabling testability with mock
//! implementations. Failure causes are modeled as tagged [`ProviderError`]
//! variants at this boundary, so retry classification works on the tag and
//! never on message text.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Why a provider call failed.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("connection to provider reset")]
    ConnectionReset,

    #[error("provider rate limit hit")]
    RateLimited,

    #[error("provider unavailable (status {status})")]
    ServerUnavailable { status: u16 },

    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("provider rejected request: {message}")]
    InvalidRequest { message: String },

    /// The call succeeded at the transport level but produced no usable
    /// structured output. Carries the raw payload for recovery, plus any
    /// usage the provider reported before things went wrong.
    #[error("no usable structured output")]
    MalformedOutput {
        raw: String,
        total_tokens: Option<u64>,
        cost: Option<f64>,
    },

    #[error("unexpected provider failure: {message}")]
    Unknown { message: String },
}

impl ProviderError {
    /// Transient failures are retried; everything else fails fast.
    /// Unrecognized causes default to permanent to avoid retry loops.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::ConnectionReset
                | ProviderError::RateLimited
                | ProviderError::ServerUnavailable { .. }
        )
    }
}

/// Requested reasoning depth for models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// One model invocation: prompt, sampling parameters, and the JSON schema the
/// reply must satisfy.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub response_schema: serde_json::Value,
}

/// Raw reply from a provider call, before verdict parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct GraderReply {
    pub content: String,
    pub total_tokens: Option<u64>,
    /// Provider-reported cost of the call in dollars.
    pub cost: Option<f64>,
}

/// Trait for executing grading model calls.
///
/// Implementations must be cheap to clone; the ensemble clones the client
/// into each concurrently spawned run.
#[async_trait]
pub trait GraderClient: Send + Sync + Clone {
    async fn complete(&self, call: &ModelCall) -> Result<GraderReply, ProviderError>;
}

// ============================================================================
// Production implementation (OpenRouter-compatible chat completions)
// ============================================================================

/// Configuration for the OpenRouter-compatible provider client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Attribution headers requested by OpenRouter.
    pub referer: String,
    pub title: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(),
            referer: "https://gradectl.dev".to_string(),
            title: "gradectl".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Production client speaking the OpenRouter chat completions protocol.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: Option<u64>,
    cost: Option<f64>,
}

impl OpenRouterClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn classify_status(status: u16, body: &str) -> Option<ProviderError> {
        match status {
            200..=299 => None,
            401 | 403 => Some(ProviderError::Unauthorized),
            408 => Some(ProviderError::Timeout),
            429 => Some(ProviderError::RateLimited),
            500..=599 => Some(ProviderError::ServerUnavailable { status }),
            _ => Some(ProviderError::InvalidRequest {
                message: snippet(body),
            }),
        }
    }

    fn classify_transport(error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout
        } else if error.is_connect() {
            ProviderError::ConnectionReset
        } else {
            ProviderError::Unknown {
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl GraderClient for OpenRouterClient {
    #[tracing::instrument(skip(self, call), fields(model = %call.model))]
    async fn complete(&self, call: &ModelCall) -> Result<GraderReply, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut body = json!({
            "model": call.model,
            "messages": [{ "role": "user", "content": call.prompt }],
            "temperature": call.temperature,
            "max_tokens": call.max_tokens,
            "response_format": {
                "type": "json_schema",
                "json_schema": call.response_schema,
            },
        });
        if let Some(effort) = call.reasoning_effort {
            body["reasoning"] = json!({ "effort": effort });
        }

        tracing::debug!(url = %url, "executing grading call");

        let response = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("HTTP-Referer", &self.config.referer)
            .header("X-Title", &self.config.title)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(Self::classify_transport)?;

        if let Some(error) = Self::classify_status(status, &text) {
            tracing::warn!(status, model = %call.model, "provider call failed");
            return Err(error);
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|_| ProviderError::MalformedOutput {
                raw: snippet(&text),
                total_tokens: None,
                cost: None,
            })?;

        let total_tokens = parsed.usage.as_ref().and_then(|u| u.total_tokens);
        let cost = parsed.usage.as_ref().and_then(|u| u.cost);

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ProviderError::MalformedOutput {
                raw: snippet(&text),
                total_tokens,
                cost,
            })?;

        tracing::debug!(
            model = %call.model,
            total_tokens,
            content_len = content.len(),
            "provider call completed"
        );

        Ok(GraderReply {
            content,
            total_tokens,
            cost,
        })
    }
}

/// Bound the payload fragment kept in errors; full bodies belong in traces,
/// not in error values that might travel.
fn snippet(text: &str) -> String {
    const MAX: usize = 600;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

// ============================================================================
// Mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock grader client for tests.
///
/// Replies are queued per model id and returned in FIFO order; calls are
/// recorded for assertions.
#[derive(Clone, Default)]
pub struct MockGraderClient {
    replies: Arc<Mutex<HashMap<String, Vec<Result<GraderReply, ProviderError>>>>>,
    calls: Arc<Mutex<Vec<ModelCall>>>,
}

impl MockGraderClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the given model. Multiple replies for the same model
    /// are returned in the order they were added.
    pub fn add_reply(&self, model: &str, reply: Result<GraderReply, ProviderError>) {
        self.replies
            .lock()
            .entry(model.to_string())
            .or_default()
            .push(reply);
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.model == model).count()
    }
}

#[async_trait]
impl GraderClient for MockGraderClient {
    async fn complete(&self, call: &ModelCall) -> Result<GraderReply, ProviderError> {
        self.calls.lock().push(call.clone());

        let mut replies = self.replies.lock();
        if let Some(queue) = replies.get_mut(&call.model) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        Err(ProviderError::Unknown {
            message: format!("no mock reply configured for model {}", call.model),
        })
    }
}
