use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    pub output: String,
}

/// Display-sink events, delivered in the order the stream produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Token(String),
    /// Model reasoning; never part of the final answer.
    Reasoning(String),
    ToolCallStart(ToolCallInfo),
    ToolCallEnd(ToolResult),
    Done,
    Error(String),
}
