//! MedeX conversation core: query classification, prompt synthesis,
//! conversation history, and the streaming tool-call loop, tied together by
//! [`MedexRuntime`].

pub mod classifier;
pub mod diagnosis;
mod events;
pub mod history;
pub mod image;
pub mod knowledge;
pub mod prompt_builder;
mod runtime;
pub mod stats;
pub mod tool_loop;

pub use classifier::{
    Classification, ClinicalContext, EmergencyCategory, Gender, UrgencyLevel, UserType, classify,
};
pub use diagnosis::{DiagnosticResponse, MedicalAnalysis};
pub use events::{StreamEvent, ToolCallInfo, ToolResult};
pub use history::{ConversationHistory, ConversationTurn, HistoryError, TranscriptWriter};
pub use image::{ImageAttachment, ImageError};
pub use knowledge::{KnowledgeBase, KnowledgeHit, StaticKnowledgeBase};
pub use runtime::{MedexRuntime, Query, RuntimeError, TurnReply};
pub use stats::{SessionStats, SessionStatsSnapshot};
pub use tool_loop::{OrchestratorError, ToolLoop, ToolLoopConfig, ToolLoopOutcome};
