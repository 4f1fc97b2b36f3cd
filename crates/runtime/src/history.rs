//! Conversation history: the in-memory turn log that feeds context into the
//! next request, plus an optional daily JSONL transcript on disk.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use medex_llm::ChatMessage;

use crate::classifier::Classification;
use crate::prompt_builder::truncate_for_prompt;

// ──────────────────────────────────────────────────────────────────────────────
// Turns
// ──────────────────────────────────────────────────────────────────────────────

/// One completed query → answer cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub classification: Classification,
    pub response: String,
}

impl ConversationTurn {
    pub fn new(
        query: impl Into<String>,
        classification: Classification,
        response: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            query: query.into(),
            classification,
            response: response.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("turn {0} is already recorded")]
    DuplicateTurn(Uuid),
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory log
// ──────────────────────────────────────────────────────────────────────────────

/// Append-only, insertion-ordered turn log.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
    ids: HashSet<Uuid>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished turn.  A turn whose id is already present (a retried
    /// append) is rejected rather than stored twice.
    pub fn append(&mut self, turn: ConversationTurn) -> Result<(), HistoryError> {
        if !self.ids.insert(turn.id) {
            return Err(HistoryError::DuplicateTurn(turn.id));
        }
        self.turns.push(turn);
        Ok(())
    }

    /// The last `n` turns, oldest first.
    pub fn recent_window(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Replay the last `window` turns as alternating user / assistant
    /// messages, each assistant reply cut to `budget_chars` characters.
    pub fn history_messages(&self, window: usize, budget_chars: usize) -> Vec<ChatMessage> {
        self.recent_window(window)
            .iter()
            .flat_map(|turn| {
                [
                    ChatMessage::user(turn.query.clone()),
                    ChatMessage::assistant(truncate_for_prompt(&turn.response, budget_chars)),
                ]
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Transcript persistence
// ──────────────────────────────────────────────────────────────────────────────

/// Appends completed turns to `<dir>/YYYY-MM-DD.jsonl`, one JSON object per
/// line, using the local date at write time.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Today's transcript file.
    pub fn current_path(&self) -> PathBuf {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.dir.join(format!("{today}.jsonl"))
    }

    /// Creates the file (and parent directories) if they don't exist.
    pub fn append(&self, turn: &ConversationTurn) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create transcript dir {}", self.dir.display()))?;
        let path = self.current_path();
        let line = serde_json::to_string(turn).context("serialize ConversationTurn")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open transcript {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Load up to `max_turns` most-recent turns from a transcript file.
/// A missing file yields an empty `Vec`; blank and malformed lines are skipped.
pub fn load_transcript(path: &Path, max_turns: usize) -> Result<Vec<ConversationTurn>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let file = fs::File::open(path).with_context(|| format!("open transcript {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut turns: Vec<ConversationTurn> = reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            serde_json::from_str(trimmed).ok()
        })
        .collect();

    if turns.len() > max_turns {
        let skip = turns.len() - max_turns;
        turns.drain(..skip);
    }
    Ok(turns)
}

// ── Tests ────────────────────────────────────────────────────────────────────
