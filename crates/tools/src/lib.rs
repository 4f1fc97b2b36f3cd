use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tool declarations ────────────────────────────────────────────────────────

/// How the completion service should treat a declared tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// A client-executed function with a JSON-schema parameter list.
    #[default]
    Function,
    /// A capability the hosted service runs itself (e.g. Moonshot's
    /// `$web_search`); only the name is declared.
    BuiltinFunction,
}

impl ToolKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "function" => Some(Self::Function),
            "builtin_function" | "builtin" => Some(Self::BuiltinFunction),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::BuiltinFunction => "builtin_function",
        }
    }
}

/// A string parameter that a function tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }
}

/// Static metadata about a tool, rendered into the request's `tools` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    #[serde(default)]
    pub kind: ToolKind,
}

impl ToolSpec {
    /// Render the `tools` array element for this tool.
    ///
    /// Built-in tools declare only their name:
    ///
    /// ```json
    /// { "type": "builtin_function", "function": { "name": "$web_search" } }
    /// ```
    ///
    /// Function tools additionally carry a description and a JSON-schema
    /// `parameters` object.
    pub fn to_declaration(&self) -> Value {
        if self.kind == ToolKind::BuiltinFunction {
            return serde_json::json!({
                "type": self.kind.as_str(),
                "function": { "name": self.name },
            });
        }

        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();
        for p in &self.params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({ "type": "string", "description": p.description }),
            );
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": self.kind.as_str(),
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// Convert a slice of `ToolSpec` into the `tools` JSON array of a
/// chat-completions request.
pub fn specs_to_tools_json(specs: &[ToolSpec]) -> Value {
    Value::Array(specs.iter().map(ToolSpec::to_declaration).collect())
}

// ── Tool trait, executor and registry ────────────────────────────────────────

/// Trait implemented by every tool.  Arguments and results are opaque JSON.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &Value) -> Result<Value>;
}

/// Executes a named tool with already-parsed arguments.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &Value) -> Result<Value>;
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The `tools` array for every registered tool, or `None` when empty.
    pub fn declarations(&self) -> Option<Value> {
        if self.tools.is_empty() {
            None
        } else {
            Some(specs_to_tools_json(&self.list_specs()))
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: &Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown tool: {name}"))?;
        tool.run(args).await
    }
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::WebSearchTool;

// ── Tests ────────────────────────────────────────────────────────────────────
