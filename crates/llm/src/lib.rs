//! Completion-service plumbing: the chat message model, streaming deltas,
//! the [`CompletionTransport`] seam, and an OpenAI-compatible HTTP client.

mod client;
mod message;
mod stream;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

pub use client::OpenAiCompatClient;
pub use message::{ChatMessage, ContentPart, MessageContent, Role, ToolCallRequest};
pub use stream::{DeltaStream, FinishReason, StreamDelta, ToolCallFragment, parse_chunk};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion service unreachable: {0}")]
    Upstream(String),
    #[error("completion service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("completion service timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed upstream data: {0}")]
    Malformed(String),
    #[error("no API key configured (set MOONSHOT_API_KEY or llm.api_key)")]
    MissingApiKey,
}

impl LlmError {
    /// `true` when the service answered but the payload could not be read.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

/// `response_format` values understood by OpenAI-compatible services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// One request to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    /// OpenAI-style `tools` array, already rendered.  `None` declares no tools.
    pub tools: Option<Value>,
    pub response_format: Option<ResponseFormat>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.6,
            max_tokens: 2048,
            stream: false,
            tools: None,
            response_format: None,
        }
    }

    pub fn to_wire(&self) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": self.messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": self.stream,
        });
        if let Some(tools) = &self.tools {
            payload["tools"] = tools.clone();
        }
        match self.response_format {
            Some(ResponseFormat::JsonObject) => {
                payload["response_format"] = json!({"type": "json_object"});
            }
            Some(ResponseFormat::Text) => {
                payload["response_format"] = json!({"type": "text"});
            }
            None => {}
        }
        payload
    }
}

/// The completion service as seen by the orchestrator.
///
/// Implementations may share a pooled connection across calls; callers never
/// rely on connection state surviving between requests.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Submit a streaming request and return its delta sequence.
    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError>;

    /// Submit a non-streaming request and return the assistant message.
    async fn complete(&self, request: &CompletionRequest) -> Result<ChatMessage, LlmError>;
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON object from a model reply.
///
/// Tries a fenced ` ```json ` block first, then the span between the first
/// `{` and the last `}`.  Returns `None` when neither parses as `T`.
///
/// ```rust
/// use medex_llm::extract_json_output;
///
/// let raw = "Resultado:\n```json\n{\"severity\":\"leve\"}\n```";
/// let value = extract_json_output::<serde_json::Value>(raw).unwrap();
/// assert_eq!(value["severity"], "leve");
/// ```
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                if let Ok(val) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────
