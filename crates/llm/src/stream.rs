//! Incremental response units and their OpenAI-compatible chunk decoding.

use std::pin::Pin;

use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use crate::LlmError;

/// Lazy, finite, non-restartable sequence of deltas for one request.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "tool_calls" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other(raw) => raw,
        }
    }
}

/// A partial tool call tagged by its position in the emitted list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    /// Call `type` as streamed, e.g. `builtin_function`.
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

fn extract_api_error(event: &Value) -> Option<String> {
    let error = event.get("error")?;
    if let Some(message) = error.get("message").and_then(|value| value.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("error reported during streaming".to_string())
}

/// Decode one SSE `data:` payload.
///
/// Returns `Ok(None)` for keep-alive chunks with no choices (e.g. a trailing
/// usage chunk) so callers can skip them.
pub fn parse_chunk(data: &str) -> Result<Option<StreamDelta>, LlmError> {
    let event: Value = serde_json::from_str(data)
        .map_err(|err| LlmError::Malformed(format!("chunk is not JSON: {err}; data: {data}")))?;

    if let Some(message) = extract_api_error(&event) {
        return Err(LlmError::Upstream(format!("stream error: {message}")));
    }

    let chunk: WireChunk = serde_json::from_value(event)
        .map_err(|err| LlmError::Malformed(format!("chunk schema: {err}; data: {data}")))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };

    let delta = choice.delta.unwrap_or_default();
    let tool_calls = delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            ToolCallFragment {
                index: call.index,
                id: call.id,
                kind: call.kind,
                name,
                arguments,
            }
        })
        .collect();

    Ok(Some(StreamDelta {
        content: delta.content.filter(|text| !text.is_empty()),
        reasoning: delta.reasoning_content.filter(|text| !text.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_chunk() {
        let raw = r#"{"id":"c","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hola"},"finish_reason":null}]}"#;
        let delta = parse_chunk(raw).unwrap().unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hola"));
        assert!(delta.finish_reason.is_none());
        assert!(delta.tool_calls.is_empty());
    }

    #[test]
    fn parses_reasoning_separately() {
        let raw = r#"{"choices":[{"index":0,"delta":{"reasoning_content":"pensando"}}]}"#;
        let delta = parse_chunk(raw).unwrap().unwrap();
        assert_eq!(delta.reasoning.as_deref(), Some("pensando"));
        assert!(delta.content.is_none());
    }

    #[test]
    fn parses_tool_call_fragment() {
        let raw = r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"builtin_function","function":{"name":"$web_search","arguments":""}}]}}]}"#;
        let delta = parse_chunk(raw).unwrap().unwrap();
        assert_eq!(delta.tool_calls.len(), 1);
        let fragment = &delta.tool_calls[0];
        assert_eq!(fragment.index, 0);
        assert_eq!(fragment.id.as_deref(), Some("call_1"));
        assert_eq!(fragment.kind.as_deref(), Some("builtin_function"));
        assert_eq!(fragment.name.as_deref(), Some("$web_search"));
    }

    #[test]
    fn parses_finish_reasons() {
        let raw = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#;
        let delta = parse_chunk(raw).unwrap().unwrap();
        assert_eq!(delta.finish_reason, Some(FinishReason::ToolCalls));

        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(
            FinishReason::parse("weird"),
            FinishReason::Other("weird".to_string())
        );
        assert_eq!(FinishReason::parse("length").as_str(), "length");
    }

    #[test]
    fn empty_choices_are_skipped() {
        let raw = r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;
        assert!(parse_chunk(raw).unwrap().is_none());
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(parse_chunk("not json"), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let raw = r#"{"choices":[{"delta":{"tool_calls":[{"id":"missing-index"}]}}]}"#;
        assert!(matches!(parse_chunk(raw), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn api_error_payload_is_upstream() {
        let raw = r#"{"error":{"message":"rate limited"}}"#;
        match parse_chunk(raw) {
            Err(LlmError::Upstream(message)) => assert!(message.contains("rate limited")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
