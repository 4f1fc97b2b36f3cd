//! Web search as a hosted-service capability.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Tool, ToolKind, ToolParam, ToolSpec};

/// Web search that the completion service performs itself.
///
/// With `ToolKind::BuiltinFunction` the service only needs its own
/// arguments echoed back as the tool result to run the search and resume;
/// the client never interprets the payload beyond JSON encode/decode.
pub struct WebSearchTool {
    pub name: String,
    pub kind: ToolKind,
}

impl WebSearchTool {
    pub fn new(name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new("$web_search", ToolKind::BuiltinFunction)
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: "Search the web for current medical information.".to_string(),
            params: vec![ToolParam::required("query", "Search query string")],
            kind: self.kind,
        }
    }

    async fn run(&self, args: &Value) -> Result<Value> {
        if !args.is_object() {
            bail!("{} expects a JSON object, got {args}", self.name);
        }
        debug!(tool = %self.name, query = ?args.get("query"), "echoing web search arguments");
        Ok(args.clone())
    }
}
