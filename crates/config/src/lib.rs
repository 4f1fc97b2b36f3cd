use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "MedeX".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible chat-completions API.  Overridden at
    /// runtime by `MEDEX_BASE_URL` when set.
    pub base_url: String,
    pub model: String,
    /// Bearer token.  `MOONSHOT_API_KEY` takes precedence when non-empty.
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Hard cap on request rounds within one turn.  A turn whose final
    /// allowed round still asks for tools fails instead of looping.
    pub max_tool_rounds: usize,
    /// Timeout for submitting a request and receiving response headers.
    pub request_timeout_secs: u64,
    /// Timeout for consuming one complete streamed round.
    pub round_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.moonshot.ai/v1".to_string(),
            model: "kimi-k2-0711-preview".to_string(),
            api_key: String::new(),
            temperature: 0.6,
            max_tokens: 2048,
            max_tool_rounds: 5,
            request_timeout_secs: 30,
            round_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Declare the web-search tool on non-emergency turns.
    pub web_search_enabled: bool,
    /// Tool name as the completion service knows it.
    pub web_search_name: String,
    /// Declaration `type`.  `builtin_function` lets the hosted service run
    /// the search itself; `function` expects the client to execute it.
    pub web_search_kind: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            web_search_enabled: true,
            web_search_name: "$web_search".to_string(),
            web_search_kind: "builtin_function".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Number of previous turns replayed into each request.
    pub window: usize,
    /// Character budget for each replayed assistant answer.
    pub assistant_budget_chars: usize,
    /// Append completed turns to a daily JSONL transcript.
    pub persist: bool,
    pub transcript_dir: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: 3,
            assistant_budget_chars: 500,
            persist: false,
            transcript_dir: ".medex/history".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Number of knowledge-base hits folded into the system prompt.
    pub top_k: usize,
    /// Character budget for the whole reference block.
    pub budget_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            budget_chars: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub history: HistoryConfig,
    pub knowledge: KnowledgeConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?;
        }

        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `MOONSHOT_API_KEY`, `MEDEX_BASE_URL` and `MEDEX_MODEL` from
    /// `lookup`.  Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(key) = non_empty("MOONSHOT_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(url) = non_empty("MEDEX_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = non_empty("MEDEX_MODEL") {
            self.llm.model = model;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        !self.llm.api_key.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
