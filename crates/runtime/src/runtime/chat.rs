//! Conversation turn handling: classify, prompt, stream, record.

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use medex_llm::ChatMessage;

use crate::classifier::{self, Classification};
use crate::events::StreamEvent;
use crate::history::ConversationTurn;
use crate::prompt_builder::{PromptInputs, build_knowledge_block, build_system_prompt};
use crate::tool_loop::ToolLoop;

use super::{MedexRuntime, Query, RuntimeError, TurnReply};

impl MedexRuntime {
    /// Run one chat turn to completion.
    ///
    /// Tokens and reasoning are forwarded to `observer` as they arrive.  The
    /// turn is appended to history and counted in the session stats only when
    /// the model finalizes; any error, including cancellation, leaves both
    /// untouched.
    #[instrument(
        skip_all,
        fields(bot = %self.config.agent.name, model = %self.loop_config.model)
    )]
    pub async fn respond(
        &self,
        query: impl Into<Query>,
        observer: Option<&mpsc::Sender<StreamEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TurnReply, RuntimeError> {
        let query = query.into();
        let classification = classifier::classify(&query.text);
        let emergency = classification.is_emergency();
        if emergency {
            warn!(
                category = ?classifier::emergency_category(&query.text),
                "emergency query, tools disabled for this turn"
            );
        }
        info!(
            user_type = %classification.user_type,
            urgency = %classification.urgency,
            chars = query.text.len(),
            "turn started"
        );

        let messages = self.build_turn_messages(&query, &classification).await;
        let tools_enabled = !emergency && self.tools.is_some();

        let outcome = ToolLoop::new(self.transport.as_ref(), self.executor.as_ref(), &self.loop_config)
            .with_tools(self.tools.as_ref())
            .with_original_query(&query.text)
            .run(messages, tools_enabled, observer, cancel)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "turn failed");
                if let Some(tx) = observer {
                    let _ = tx.send(StreamEvent::Error(err.to_string())).await;
                }
                return Err(err.into());
            }
        };

        let turn = ConversationTurn::new(query.text, classification.clone(), outcome.content.clone());
        let turn_id = turn.id;
        self.history.lock().await.append(turn.clone())?;
        self.stats.record_query(&classification);

        if let Some(transcript) = &self.transcript {
            if let Err(err) = transcript.append(&turn) {
                warn!(?err, "failed to persist transcript");
            }
        }

        info!(
            rounds = outcome.rounds,
            tool_calls = outcome.tool_calls.len(),
            chars = outcome.content.len(),
            "turn finished"
        );
        if let Some(tx) = observer {
            let _ = tx.send(StreamEvent::Done).await;
        }

        Ok(TurnReply {
            turn_id,
            classification,
            content: outcome.content,
            reasoning: outcome.reasoning,
            rounds: outcome.rounds,
            tool_calls: outcome.tool_calls.len(),
        })
    }

    /// System prompt (plus knowledge block), replayed history, then the
    /// current query.
    async fn build_turn_messages(&self, query: &Query, classification: &Classification) -> Vec<ChatMessage> {
        let mut system = build_system_prompt(&PromptInputs {
            assistant_name: &self.config.agent.name,
            classification,
            context: &query.context,
            now: Local::now().fixed_offset(),
        });

        if let Some(knowledge) = &self.knowledge {
            match knowledge.search(&query.text, self.config.knowledge.top_k).await {
                Ok(hits) => {
                    debug!(hits = hits.len(), "knowledge base search");
                    system.push_str(&build_knowledge_block(&hits, self.config.knowledge.budget_chars));
                }
                Err(err) => warn!(?err, "knowledge base search failed, continuing without it"),
            }
        }

        let history = self
            .history
            .lock()
            .await
            .history_messages(self.config.history.window, self.config.history.assistant_budget_chars);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history);
        messages.push(ChatMessage::user(query.text.clone()));
        messages
    }
}
