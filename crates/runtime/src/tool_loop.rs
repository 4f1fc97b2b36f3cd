//! Streaming tool-calling loop.
//!
//! Submits the message list, consumes the delta stream, assembles any tool
//! calls the model emits, executes them through the [`ToolExecutor`], feeds
//! the results back as tool-role messages, and repeats until the model
//! finishes with anything other than `tool_calls` or the round cap is hit.
//!
//! ```text
//! Requesting → Streaming ─┬─ finish=tool_calls → ToolCallsPending → ExecutingTools → Requesting
//!                         └─ any other finish  → Finalized
//! ```

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medex_config::LlmConfig;
use medex_llm::{
    ChatMessage, CompletionRequest, CompletionTransport, DeltaStream, FinishReason, LlmError,
    ToolCallFragment, ToolCallRequest,
};
use medex_tools::ToolExecutor;

use crate::events::{StreamEvent, ToolCallInfo, ToolResult};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Transport unreachable, non-success status, or a timeout.
    #[error("upstream error: {0}")]
    Upstream(#[source] LlmError),
    #[error("malformed upstream data: {0}")]
    MalformedUpstreamData(String),
    #[error("model kept requesting tools after {rounds} rounds")]
    ToolLoopExceeded { rounds: usize },
    #[error("turn cancelled")]
    Cancelled,
}

impl From<LlmError> for OrchestratorError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Malformed(detail) => Self::MalformedUpstreamData(detail),
            other => Self::Upstream(other),
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_tool_rounds: usize,
    /// Bound on submitting a request and receiving the response head.
    pub request_timeout: Duration,
    /// Bound on consuming one round's whole delta stream.
    pub round_timeout: Duration,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self::from_llm(&LlmConfig::default())
    }
}

impl ToolLoopConfig {
    pub fn from_llm(llm: &LlmConfig) -> Self {
        Self {
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            max_tool_rounds: llm.max_tool_rounds.max(1),
            request_timeout: Duration::from_secs(llm.request_timeout_secs),
            round_timeout: Duration::from_secs(llm.round_timeout_secs),
        }
    }
}

// ── State and results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Requesting,
    Streaming,
    ToolCallsPending,
    ExecutingTools,
    Finalized,
}

/// One executed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub round: usize,
    pub request: ToolCallRequest,
    /// Arguments actually handed to the executor (after repair).
    pub arguments: Value,
    pub result: Value,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopOutcome {
    /// Answer text from the finalizing round.
    pub content: String,
    /// Reasoning trace from every round, kept apart from `content`.
    pub reasoning: String,
    pub finish_reason: FinishReason,
    pub rounds: usize,
    pub tool_calls: Vec<ToolCallRecord>,
}

// ── Tool-call assembly ───────────────────────────────────────────────────────

/// Builds complete tool calls out of streamed fragments.
///
/// Fragments are addressed by `index`.  The first non-empty `id`, `kind` and
/// `name` seen for an index are kept; `arguments` text is always appended.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<ToolCallRequest>,
}

impl ToolCallAssembler {
    pub fn push(&mut self, fragment: ToolCallFragment) {
        let position = match self.calls.iter().position(|c| c.index == fragment.index) {
            Some(position) => position,
            None => {
                self.calls.push(ToolCallRequest {
                    index: fragment.index,
                    ..ToolCallRequest::default()
                });
                self.calls.len() - 1
            }
        };
        let call = &mut self.calls[position];

        if call.id.is_empty() {
            if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                call.id = id;
            }
        }
        if call.kind.is_empty() {
            if let Some(kind) = fragment.kind.filter(|kind| !kind.is_empty()) {
                call.kind = kind;
            }
        }
        if call.name.is_empty() {
            if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
                call.name = name;
            }
        }
        if let Some(arguments) = fragment.arguments {
            call.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in index order.
    pub fn finish(mut self) -> Vec<ToolCallRequest> {
        self.calls.sort_by_key(|call| call.index);
        self.calls
    }
}

/// Parse a call's argument text into a JSON object.
///
/// Text that is not a JSON object is replaced by `{"query": original_query}`;
/// the second element reports whether that repair happened.
pub fn parse_tool_arguments(raw: &str, original_query: &str) -> (Value, bool) {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => (value, false),
        _ => (json!({ "query": original_query }), true),
    }
}

// ── The loop ─────────────────────────────────────────────────────────────────

struct RoundOutput {
    content: String,
    reasoning: String,
    calls: Vec<ToolCallRequest>,
    finish_reason: FinishReason,
}

/// Borrowed collaborators for one turn.  All per-turn state lives inside
/// [`ToolLoop::run`].
pub struct ToolLoop<'a> {
    transport: &'a dyn CompletionTransport,
    executor: &'a dyn ToolExecutor,
    config: &'a ToolLoopConfig,
    tools: Option<&'a Value>,
    original_query: &'a str,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        transport: &'a dyn CompletionTransport,
        executor: &'a dyn ToolExecutor,
        config: &'a ToolLoopConfig,
    ) -> Self {
        Self {
            transport,
            executor,
            config,
            tools: None,
            original_query: "",
        }
    }

    /// The `tools` array declared on rounds where tools are enabled.
    pub fn with_tools(mut self, tools: Option<&'a Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Query text substituted into unparseable tool arguments.
    pub fn with_original_query(mut self, query: &'a str) -> Self {
        self.original_query = query;
        self
    }

    /// Drive the loop to a final answer.
    ///
    /// Content and reasoning fragments are forwarded to `observer` in arrival
    /// order.  Cancelling `cancel` drops the in-flight stream and returns
    /// [`OrchestratorError::Cancelled`].
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        tools_enabled: bool,
        observer: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<ToolLoopOutcome, OrchestratorError> {
        let tools = if tools_enabled { self.tools.cloned() } else { None };
        let cap = self.config.max_tool_rounds.max(1);
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut reasoning = String::new();

        for round in 1..=cap {
            let mut state = LoopState::Requesting;
            debug!(round, ?state, messages = messages.len(), tools = tools.is_some(), "tool loop round");

            let mut request = CompletionRequest::new(self.config.model.clone(), messages.clone());
            request.temperature = self.config.temperature;
            request.max_tokens = self.config.max_tokens;
            request.stream = true;
            request.tools = tools.clone();

            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                submitted = tokio::time::timeout(self.config.request_timeout, self.transport.stream(&request)) => {
                    match submitted {
                        Ok(stream) => stream?,
                        Err(_) => {
                            return Err(OrchestratorError::Upstream(LlmError::Timeout(
                                self.config.request_timeout,
                            )));
                        }
                    }
                }
            };

            state = LoopState::Streaming;
            debug!(round, ?state, "consuming deltas");

            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(round, "turn cancelled while streaming");
                    return Err(OrchestratorError::Cancelled);
                }
                consumed = tokio::time::timeout(self.config.round_timeout, consume_round(stream, observer)) => {
                    match consumed {
                        Ok(output) => output?,
                        Err(_) => {
                            return Err(OrchestratorError::Upstream(LlmError::Timeout(
                                self.config.round_timeout,
                            )));
                        }
                    }
                }
            };

            reasoning.push_str(&output.reasoning);

            if output.finish_reason != FinishReason::ToolCalls {
                state = LoopState::Finalized;
                debug!(round, ?state, finish = output.finish_reason.as_str(), chars = output.content.len(), "tool loop finished");
                return Ok(ToolLoopOutcome {
                    content: output.content,
                    reasoning,
                    finish_reason: output.finish_reason,
                    rounds: round,
                    tool_calls: records,
                });
            }

            if tools.is_none() {
                // Nothing was declared, so there is nothing to run: the
                // round's text is the answer.
                state = LoopState::Finalized;
                warn!(round, ?state, calls = output.calls.len(), "tool calls requested with no tools declared, finalizing");
                return Ok(ToolLoopOutcome {
                    content: output.content,
                    reasoning,
                    finish_reason: output.finish_reason,
                    rounds: round,
                    tool_calls: records,
                });
            }

            state = LoopState::ToolCallsPending;
            if output.calls.is_empty() {
                return Err(OrchestratorError::MalformedUpstreamData(
                    "finish_reason is tool_calls but no tool calls were streamed".to_string(),
                ));
            }
            if round == cap {
                warn!(round, cap, "tool loop hit max rounds");
                return Err(OrchestratorError::ToolLoopExceeded { rounds: round });
            }
            info!(round, ?state, count = output.calls.len(), "model requested tool calls");

            let calls: Vec<ToolCallRequest> = output
                .calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = format!("call_{round}_{}", call.index);
                        warn!(index = call.index, id = %call.id, "tool call arrived without id");
                    }
                    call
                })
                .collect();
            messages.push(ChatMessage::assistant_tool_calls(output.content, calls.clone()));

            state = LoopState::ExecutingTools;
            debug!(round, ?state, "executing tools");
            let executed = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(round, "turn cancelled while executing tools");
                    return Err(OrchestratorError::Cancelled);
                }
                executed = tokio::time::timeout(self.config.round_timeout, self.execute_calls(round, calls, observer)) => {
                    match executed {
                        Ok(executed) => executed,
                        Err(_) => {
                            warn!(round, "tool execution timed out");
                            return Err(OrchestratorError::Upstream(LlmError::Timeout(
                                self.config.round_timeout,
                            )));
                        }
                    }
                }
            };
            for record in executed {
                messages.push(ChatMessage::tool_result(
                    record.request.id.clone(),
                    record.request.name.clone(),
                    record.result.to_string(),
                ));
                records.push(record);
            }
        }

        // Every round either returns or continues; only a cap of zero could
        // fall through, and the cap is clamped to at least one.
        Err(OrchestratorError::ToolLoopExceeded { rounds: cap })
    }

    /// Run one round's calls in issue order.
    async fn execute_calls(
        &self,
        round: usize,
        calls: Vec<ToolCallRequest>,
        observer: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Vec<ToolCallRecord> {
        let mut records = Vec::with_capacity(calls.len());
        for call in calls {
            records.push(self.execute_call(round, call, observer).await);
        }
        records
    }

    async fn execute_call(
        &self,
        round: usize,
        call: ToolCallRequest,
        observer: Option<&mpsc::Sender<StreamEvent>>,
    ) -> ToolCallRecord {
        let (arguments, repaired) = parse_tool_arguments(&call.arguments, self.original_query);
        if repaired {
            warn!(
                tool = %call.name,
                raw = %call.arguments,
                "malformed tool arguments, substituting original query"
            );
        }

        notify(
            observer,
            StreamEvent::ToolCallStart(ToolCallInfo {
                id: call.id.clone(),
                name: call.name.clone(),
                args: arguments.to_string(),
            }),
        )
        .await;

        let (result, success) = match self.executor.execute(&call.name, &arguments).await {
            Ok(result) => (result, true),
            Err(err) => {
                warn!(tool = %call.name, error = %err, "tool execution failed");
                (json!({ "error": err.to_string() }), false)
            }
        };
        debug!(tool = %call.name, success, "tool call finished");

        notify(
            observer,
            StreamEvent::ToolCallEnd(ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                success,
                output: result.to_string(),
            }),
        )
        .await;

        ToolCallRecord {
            round,
            request: call,
            arguments,
            result,
            success,
        }
    }
}

/// Read one round's deltas until a finish reason arrives.
async fn consume_round(
    mut stream: DeltaStream,
    observer: Option<&mpsc::Sender<StreamEvent>>,
) -> Result<RoundOutput, OrchestratorError> {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut assembler = ToolCallAssembler::default();

    while let Some(delta) = stream.next().await {
        let delta = delta?;

        if let Some(text) = delta.reasoning {
            reasoning.push_str(&text);
            notify(observer, StreamEvent::Reasoning(text)).await;
        }
        if let Some(text) = delta.content {
            content.push_str(&text);
            notify(observer, StreamEvent::Token(text)).await;
        }
        for fragment in delta.tool_calls {
            assembler.push(fragment);
        }

        if let Some(finish_reason) = delta.finish_reason {
            return Ok(RoundOutput {
                content,
                reasoning,
                calls: assembler.finish(),
                finish_reason,
            });
        }
    }

    Err(OrchestratorError::MalformedUpstreamData(
        "stream ended without a finish reason".to_string(),
    ))
}

async fn notify(observer: Option<&mpsc::Sender<StreamEvent>>, event: StreamEvent) {
    if let Some(tx) = observer {
        // A closed display sink must not abort the turn.
        let _ = tx.send(event).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use medex_llm::StreamDelta;

    fn config(cap: usize) -> ToolLoopConfig {
        ToolLoopConfig {
            model: "kimi-test".into(),
            temperature: 0.6,
            max_tokens: 256,
            max_tool_rounds: cap,
            request_timeout: Duration::from_secs(5),
            round_timeout: Duration::from_secs(5),
        }
    }

    fn decl() -> Value {
        json!([{"type": "builtin_function", "function": {"name": "$web_search"}}])
    }

    fn base_messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("sys"), ChatMessage::user("hola")]
    }

    #[test]
    fn assembles_fragments_by_index() {
        let mut assembler = ToolCallAssembler::default();
        assembler.push(ToolCallFragment {
            index: 0,
            name: Some("x".into()),
            ..Default::default()
        });
        assembler.push(ToolCallFragment {
            index: 0,
            arguments: Some("{\"q\"".into()),
            ..Default::default()
        });
        assembler.push(ToolCallFragment {
            index: 0,
            arguments: Some("\":1}".into()),
            ..Default::default()
        });
        let calls = assembler.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "x");
        assert_eq!(calls[0].arguments, "{\"q\":1}");
    }

    #[test]
    fn first_non_empty_id_and_name_win() {
        let mut assembler = ToolCallAssembler::default();
        assembler.push(ToolCallFragment {
            index: 1,
            id: Some(String::new()),
            name: Some(String::new()),
            ..Default::default()
        });
        assembler.push(ToolCallFragment {
            index: 0,
            id: Some("a".into()),
            name: Some("first".into()),
            ..Default::default()
        });
        assembler.push(ToolCallFragment {
            index: 1,
            id: Some("b".into()),
            name: Some("second".into()),
            ..Default::default()
        });
        assembler.push(ToolCallFragment {
            index: 0,
            id: Some("z".into()),
            name: Some("ignored".into()),
            ..Default::default()
        });
        let calls = assembler.finish();
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].id, "b");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn arguments_roundtrip_to_the_same_object() {
        let original = json!({"query": "metformina dosis", "limit": 3});
        let text = serde_json::to_string(&original).unwrap();

        let mut assembler = ToolCallAssembler::default();
        for chunk in text.as_bytes().chunks(4) {
            assembler.push(ToolCallFragment {
                index: 0,
                arguments: Some(String::from_utf8(chunk.to_vec()).unwrap()),
                ..Default::default()
            });
        }
        let calls = assembler.finish();
        let (parsed, repaired) = parse_tool_arguments(&calls[0].arguments, "unused");
        assert!(!repaired);
        assert_eq!(parsed, original);
    }

    #[test]
    fn unparseable_arguments_fall_back_to_query() {
        for raw in ["", "{broken", "[1,2]", "\"text\""] {
            let (value, repaired) = parse_tool_arguments(raw, "dolor de cabeza");
            assert!(repaired, "{raw}");
            assert_eq!(value, json!({"query": "dolor de cabeza"}));
        }
    }

    #[tokio::test]
    async fn plain_answer_finalizes_in_one_round() {
        let transport = ScriptedTransport::new(vec![text_round("Hola")]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.content, "Hola");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].stream);
        assert_eq!(requests[0].tools, Some(decl()));
    }

    #[tokio::test]
    async fn tools_disabled_declares_nothing() {
        let transport = ScriptedTransport::new(vec![text_round("ok")]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .run(base_messages(), false, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(transport.requests()[0].tools.is_none());
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back_in_order() {
        let transport = ScriptedTransport::new(vec![
            Script::Deltas(vec![
                Ok(StreamDelta::content("Buscando… ")),
                Ok(StreamDelta::tool_call(ToolCallFragment {
                    index: 0,
                    id: Some("c0".into()),
                    kind: Some("builtin_function".into()),
                    name: Some("$web_search".into()),
                    arguments: Some(r#"{"query":"#.into()),
                })),
                Ok(StreamDelta::tool_call(ToolCallFragment {
                    index: 1,
                    id: Some("c1".into()),
                    name: Some("broken".into()),
                    arguments: Some("{}".into()),
                    ..Default::default()
                })),
                Ok(StreamDelta::tool_call(ToolCallFragment {
                    index: 0,
                    arguments: Some(r#""asma"}"#.into()),
                    ..Default::default()
                })),
                Ok(StreamDelta::finish(FinishReason::ToolCalls)),
            ]),
            text_round("El asma es…"),
        ]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .with_original_query("asma")
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.content, "El asma es…");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.tool_calls.len(), 2);
        assert!(outcome.tool_calls[0].success);
        assert_eq!(outcome.tool_calls[0].arguments, json!({"query": "asma"}));
        assert!(!outcome.tool_calls[1].success);

        let second = &transport.requests()[1].messages;
        assert_eq!(second.len(), 5);
        match &second[2] {
            ChatMessage::Assistant { content, tool_calls } => {
                assert_eq!(content, "Buscando… ");
                assert_eq!(tool_calls.len(), 2);
                assert_eq!(tool_calls[0].id, "c0");
                assert_eq!(tool_calls[0].kind, "builtin_function");
            }
            other => panic!("expected assistant tool calls, got {other:?}"),
        }
        match (&second[3], &second[4]) {
            (
                ChatMessage::Tool { tool_call_id: a, content: a_body, .. },
                ChatMessage::Tool { tool_call_id: b, content: b_body, .. },
            ) => {
                assert_eq!(a, "c0");
                assert_eq!(serde_json::from_str::<Value>(a_body).unwrap(), json!({"query": "asma"}));
                assert_eq!(b, "c1");
                assert!(b_body.contains("tool exploded"));
            }
            other => panic!("expected tool messages, got {other:?}"),
        }

        let executed = executor.calls.lock().unwrap().clone();
        assert_eq!(executed[0].0, "$web_search");
        assert_eq!(executed[1].0, "broken");
    }

    #[tokio::test]
    async fn malformed_arguments_are_repaired_not_fatal() {
        let transport = ScriptedTransport::new(vec![
            tool_round("c0", "{not json"),
            text_round("listo"),
        ]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .with_original_query("fiebre en niños")
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, "listo");
        assert_eq!(
            executor.calls.lock().unwrap()[0].1,
            json!({"query": "fiebre en niños"})
        );
    }

    #[tokio::test]
    async fn endless_tool_requests_stop_exactly_at_cap() {
        for cap in [1, 3, 5] {
            let transport = ScriptedTransport::always_requesting_tools();
            let executor = EchoExecutor::default();
            let cfg = config(cap);
            let tools = decl();
            let err = ToolLoop::new(&transport, &executor, &cfg)
                .with_tools(Some(&tools))
                .run(base_messages(), true, None, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(
                matches!(err, OrchestratorError::ToolLoopExceeded { rounds } if rounds == cap),
                "cap {cap}: {err:?}"
            );
            assert_eq!(transport.requests().len(), cap);
            assert_eq!(executor.calls.lock().unwrap().len(), cap - 1);
        }
    }

    #[tokio::test]
    async fn content_and_reasoning_reach_observer_in_order() {
        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![
            Ok(StreamDelta::reasoning("pienso")),
            Ok(StreamDelta::content("Ho")),
            Ok(StreamDelta::content("la")),
            Ok(StreamDelta::reasoning(" más")),
            Ok(StreamDelta::content("!")),
            Ok(StreamDelta::finish(FinishReason::Stop)),
        ])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, Some(&tx), &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        assert_eq!(outcome.content, "Hola!");
        assert_eq!(outcome.reasoning, "pienso más");

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                StreamEvent::Reasoning("pienso".into()),
                StreamEvent::Token("Ho".into()),
                StreamEvent::Token("la".into()),
                StreamEvent::Reasoning(" más".into()),
                StreamEvent::Token("!".into()),
            ]
        );
    }

    #[tokio::test]
    async fn length_finish_is_final() {
        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![
            Ok(StreamDelta::content("cortado")),
            Ok(StreamDelta::finish(FinishReason::Length)),
        ])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.finish_reason, FinishReason::Length);
        assert_eq!(outcome.content, "cortado");
    }

    #[tokio::test]
    async fn stream_without_finish_is_malformed() {
        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![Ok(StreamDelta::content("a"))])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedUpstreamData(_)));
    }

    #[tokio::test]
    async fn tool_calls_finish_without_calls_is_malformed() {
        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![Ok(StreamDelta::finish(
            FinishReason::ToolCalls,
        ))])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedUpstreamData(_)));
    }

    #[tokio::test]
    async fn upstream_and_malformed_errors_are_distinguished() {
        let transport = ScriptedTransport::new(vec![Script::Fail(LlmError::Status {
            status: 503,
            body: "busy".into(),
        })]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(LlmError::Status { status: 503, .. })));

        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![Err(LlmError::Malformed(
            "bad chunk".into(),
        ))])]);
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedUpstreamData(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_a_hanging_stream() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![StreamDelta::content("parcial")])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            // Cancel as soon as the first token is visible.
            if let Some(StreamEvent::Token(_)) = rx.recv().await {
                canceller.cancel();
            }
        });

        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, Some(&tx), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_round_times_out_as_upstream() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![])]);
        let executor = EchoExecutor::default();
        let mut cfg = config(5);
        cfg.round_timeout = Duration::from_secs(2);
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(LlmError::Timeout(d)) if d == Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_submission_times_out_as_upstream() {
        let transport = ScriptedTransport::new(vec![Script::Stall]);
        let executor = EchoExecutor::default();
        let mut cfg = config(5);
        cfg.request_timeout = Duration::from_secs(3);
        cfg.round_timeout = Duration::from_secs(60);
        let err = ToolLoop::new(&transport, &executor, &cfg)
            .run(base_messages(), true, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(LlmError::Timeout(d)) if d == Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_tool_times_out_as_upstream() {
        let transport = ScriptedTransport::new(vec![tool_round("c0", r#"{"query":"x"}"#), text_round("nunca")]);
        let executor = StalledExecutor;
        let mut cfg = config(5);
        cfg.round_timeout = Duration::from_secs(5);
        let tools = decl();
        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            ToolLoop::new(&transport, &executor, &cfg)
                .with_tools(Some(&tools))
                .run(base_messages(), true, None, &CancellationToken::new()),
        )
        .await
        .expect("tool phase must be bounded by the round timeout");
        let err = result.unwrap_err();
        assert!(matches!(err, OrchestratorError::Upstream(LlmError::Timeout(d)) if d == Duration::from_secs(5)));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_a_stalled_tool() {
        let transport = ScriptedTransport::new(vec![tool_round("c0", r#"{"query":"x"}"#), text_round("nunca")]);
        let executor = StalledExecutor;
        let mut cfg = config(5);
        cfg.round_timeout = Duration::from_secs(5);
        let tools = decl();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(3600),
            ToolLoop::new(&transport, &executor, &cfg)
                .with_tools(Some(&tools))
                .run(base_messages(), true, None, &cancel),
        )
        .await
        .expect("cancellation must end the tool phase")
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tool_calls_without_declared_tools_finalize_in_one_round() {
        let transport = ScriptedTransport::new(vec![Script::Deltas(vec![
            Ok(StreamDelta::content("Llame al 911 ahora.")),
            Ok(StreamDelta::tool_call(ToolCallFragment {
                index: 0,
                id: Some("c0".into()),
                name: Some("$web_search".into()),
                arguments: Some("{}".into()),
                ..Default::default()
            })),
            Ok(StreamDelta::finish(FinishReason::ToolCalls)),
        ])]);
        let executor = EchoExecutor::default();
        let cfg = config(5);
        let tools = decl();
        let outcome = ToolLoop::new(&transport, &executor, &cfg)
            .with_tools(Some(&tools))
            .run(base_messages(), false, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.content, "Llame al 911 ahora.");
        assert_eq!(outcome.rounds, 1);
        assert!(outcome.tool_calls.is_empty());
        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn streamed_call_kind_is_echoed_back() {
        let chunks = [
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"builtin_function","function":{"name":"$web_search","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":\"asma\"}"}}]}}]}"#,
        ];
        let mut assembler = ToolCallAssembler::default();
        for chunk in chunks {
            let delta = medex_llm::parse_chunk(chunk).unwrap().unwrap();
            for fragment in delta.tool_calls {
                assembler.push(fragment);
            }
        }
        let calls = assembler.finish();
        assert_eq!(calls[0].kind, "builtin_function");

        let wire = ChatMessage::assistant_tool_calls("", calls).to_wire();
        assert_eq!(wire["tool_calls"][0]["type"], "builtin_function");
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"query":"asma"}"#);
    }
}
