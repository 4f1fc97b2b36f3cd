use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use futures::future;
use tracing::{debug, trace};

use crate::{ChatMessage, CompletionRequest, CompletionTransport, DeltaStream, LlmError, parse_chunk};

/// Client for OpenAI-compatible `/chat/completions` endpoints (Moonshot by
/// default).  Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, request: &CompletionRequest) -> Result<reqwest::Response, LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let payload = request.to_wire();
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            tools = request.tools.is_some(),
            "submitting completion request"
        );

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// List model identifiers served by the endpoint.  Used as a cheap
    /// credentials/connectivity check.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let response = self
            .client
            .get(self.endpoint("models"))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(6))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        let mut models = body
            .get("data")
            .and_then(|data| data.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(|id| id.as_str()))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        models.sort();
        models.dedup();
        Ok(models)
    }
}

#[async_trait]
impl CompletionTransport for OpenAiCompatClient {
    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.post(&request).await?;

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(event) if event.data.trim() == "[DONE]"))
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) => {
                        trace!(data = %event.data, "sse chunk");
                        parse_chunk(&event.data).transpose()
                    }
                    Err(err) => Some(Err(sse_error(err))),
                }
            });

        Ok(Box::pin(deltas))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ChatMessage, LlmError> {
        let mut request = request.clone();
        request.stream = false;
        let response = self.post(&request).await?;

        let body: serde_json::Value = response.json().await?;
        let message = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| LlmError::Malformed(format!("response has no choices: {body}")))?;
        ChatMessage::from_wire(message)
    }
}

/// Undecodable event bytes are malformed data; only a failing byte stream
/// is an upstream failure.
fn sse_error<E: std::fmt::Display>(err: EventStreamError<E>) -> LlmError {
    match err {
        EventStreamError::Utf8(err) => LlmError::Malformed(format!("SSE stream is not UTF-8: {err}")),
        EventStreamError::Parser(err) => LlmError::Malformed(format!("SSE framing error: {err}")),
        EventStreamError::Transport(err) => LlmError::Upstream(format!("SSE stream error: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_decode_errors_are_malformed_and_transport_errors_upstream() {
        let utf8 = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(
            sse_error::<std::io::Error>(EventStreamError::Utf8(utf8)),
            LlmError::Malformed(_)
        ));

        let transport = std::io::Error::other("connection reset");
        match sse_error(EventStreamError::Transport(transport)) {
            LlmError::Upstream(detail) => assert!(detail.contains("connection reset")),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = OpenAiCompatClient::new("https://api.moonshot.ai/v1/", "sk").unwrap();
        assert_eq!(
            client.endpoint("chat/completions"),
            "https://api.moonshot.ai/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_network() {
        let client = OpenAiCompatClient::new("http://127.0.0.1:9", " ").unwrap();
        let request = CompletionRequest::new("kimi", vec![ChatMessage::user("hola")]);
        assert!(matches!(
            client.complete(&request).await,
            Err(LlmError::MissingApiKey)
        ));
        assert!(matches!(
            client.stream(&request).await,
            Err(LlmError::MissingApiKey)
        ));
        assert!(matches!(
            client.list_models().await,
            Err(LlmError::MissingApiKey)
        ));
    }
}
