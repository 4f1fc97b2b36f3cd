//! Core runtime: owns the collaborators, the conversation log and the
//! session counters, and drives one turn at a time through the tool loop.

mod analysis;
mod chat;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use medex_config::{AppConfig, ToolsConfig};
use medex_llm::{CompletionTransport, LlmError, OpenAiCompatClient};
use medex_tools::{ToolExecutor, ToolKind, ToolRegistry, WebSearchTool};

use crate::classifier::Classification;
use crate::history::{ConversationHistory, ConversationTurn, HistoryError, TranscriptWriter};
use crate::image::ImageError;
use crate::knowledge::KnowledgeBase;
use crate::stats::{SessionStats, SessionStatsSnapshot};
use crate::tool_loop::{OrchestratorError, ToolLoopConfig};

/// A user query plus an optional side channel of caller context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub text: String,
    pub context: Map<String, Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// The result of a successful chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub turn_id: Uuid,
    pub classification: Classification,
    pub content: String,
    pub reasoning: String,
    pub rounds: usize,
    pub tool_calls: usize,
}

pub struct MedexRuntime {
    config: AppConfig,
    loop_config: ToolLoopConfig,
    transport: Arc<dyn CompletionTransport>,
    executor: Arc<dyn ToolExecutor>,
    /// Declared on non-emergency turns; `None` when web search is disabled.
    tools: Option<Value>,
    history: Mutex<ConversationHistory>,
    stats: Arc<SessionStats>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    transcript: Option<TranscriptWriter>,
}

impl std::fmt::Debug for MedexRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MedexRuntime")
            .field("model", &self.loop_config.model)
            .field("tools", &self.tools.is_some())
            .field("knowledge", &self.knowledge.is_some())
            .field("transcript", &self.transcript.as_ref().map(TranscriptWriter::dir))
            .finish_non_exhaustive()
    }
}

impl MedexRuntime {
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn CompletionTransport>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let tools = tool_registry(&config.tools).declarations();
        Self::assemble(config, transport, executor, tools)
    }

    /// Wire the HTTP transport and the tool registry from configuration.
    pub fn from_config(config: AppConfig) -> Result<Self, LlmError> {
        let client = OpenAiCompatClient::new(config.llm.base_url.clone(), config.llm.api_key.clone())?;

        let registry = tool_registry(&config.tools);
        let tools = registry.declarations();
        let transcript = config
            .history
            .persist
            .then(|| TranscriptWriter::new(config.history.transcript_dir.clone()));

        let mut runtime = Self::assemble(config, Arc::new(client), Arc::new(registry), tools);
        runtime.transcript = transcript;
        Ok(runtime)
    }

    fn assemble(
        config: AppConfig,
        transport: Arc<dyn CompletionTransport>,
        executor: Arc<dyn ToolExecutor>,
        tools: Option<Value>,
    ) -> Self {
        Self {
            loop_config: ToolLoopConfig::from_llm(&config.llm),
            config,
            transport,
            executor,
            tools,
            history: Mutex::new(ConversationHistory::new()),
            stats: Arc::new(SessionStats::new()),
            knowledge: None,
            transcript: None,
        }
    }

    pub fn with_knowledge_base(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_transcript(mut self, transcript: TranscriptWriter) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn recent_turns(&self, n: usize) -> Vec<ConversationTurn> {
        self.history.lock().await.recent_window(n).to_vec()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }
}

/// Every tool the configuration enables.  Declarations and execution are
/// both derived from this registry.
fn tool_registry(tools: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    if let Some(tool) = web_search_tool(tools) {
        registry.register(Box::new(tool));
    }
    registry
}

fn web_search_tool(tools: &ToolsConfig) -> Option<WebSearchTool> {
    if !tools.web_search_enabled {
        return None;
    }
    let kind = ToolKind::parse(&tools.web_search_kind).unwrap_or_else(|| {
        warn!(kind = %tools.web_search_kind, "unknown web search kind, using builtin_function");
        ToolKind::BuiltinFunction
    });
    Some(WebSearchTool::new(tools.web_search_name.clone(), kind))
}
