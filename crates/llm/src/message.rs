//! Chat message model shared by the transport and the orchestrator.
//!
//! Each role carries only the fields that are valid for it: tool calls exist
//! only on assistant messages and a `tool_call_id` only on tool messages.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One segment of a multipart user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text { text: String },
    /// An image reference, usually a `data:` URL.
    ImageUrl { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text segments; image parts are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Parts(parts) => Value::Array(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::ImageUrl { url } => {
                            json!({"type": "image_url", "image_url": {"url": url}})
                        }
                    })
                    .collect(),
            ),
        }
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw argument text exactly as the service streamed it;
/// it is only parsed when the call is handed to a tool executor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub index: usize,
    pub id: String,
    /// Call `type` echoed back to the service; empty means `function`.
    #[serde(default)]
    pub kind: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn wire_kind(&self) -> &str {
        if self.kind.is_empty() { "function" } else { &self.kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: MessageContent,
    },
    Assistant {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::User {
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }

    /// Plain-text view of the message body.
    pub fn text(&self) -> String {
        match self {
            Self::System { content } => content.clone(),
            Self::User { content } => content.text(),
            Self::Assistant { content, .. } => content.clone(),
            Self::Tool { content, .. } => content.clone(),
        }
    }

    /// OpenAI chat-completions wire representation.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::System { content } => json!({"role": "system", "content": content}),
            Self::User { content } => json!({"role": "user", "content": content.to_wire()}),
            Self::Assistant {
                content,
                tool_calls,
            } => {
                let mut message = json!({"role": "assistant", "content": content});
                if !tool_calls.is_empty() {
                    message["tool_calls"] = Value::Array(
                        tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "index": call.index,
                                    "id": call.id,
                                    "type": call.wire_kind(),
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments,
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                message
            }
            Self::Tool {
                tool_call_id,
                name,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "name": name,
                "content": content,
            }),
        }
    }

    /// Parse the `choices[0].message` object of a non-streaming response.
    pub fn from_wire(value: &Value) -> Result<Self, LlmError> {
        let wire: WireMessage = serde_json::from_value(value.clone())
            .map_err(|err| LlmError::Malformed(format!("response message: {err}")))?;

        if wire.role.as_deref().is_some_and(|role| role != "assistant") {
            return Err(LlmError::Malformed(format!(
                "expected assistant message, got role {:?}",
                wire.role
            )));
        }

        let tool_calls = wire
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(position, call)| ToolCallRequest {
                index: call.index.unwrap_or(position),
                id: call.id.unwrap_or_default(),
                kind: call.kind.unwrap_or_default(),
                name: call.function.name,
                arguments: call.function.arguments.unwrap_or_default(),
            })
            .collect();

        Ok(Self::Assistant {
            content: wire.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: Option<String>,
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    index: Option<usize>,
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: Option<String>,
}
