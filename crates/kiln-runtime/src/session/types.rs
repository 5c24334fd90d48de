//! Session vocabulary: kinds, states, results, statistics and events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::{KilnError, SessionId, TaskId};
use kiln_engine::StopReason;
use serde::{Deserialize, Serialize};

/// What a session is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionType {
    /// Multi-turn conversation; replies are appended to the history.
    Chat,
    /// Raw text completion over the history.
    Completion,
    /// Embedding extraction.
    Embedding,
    /// Prompts with images or audio.
    Multimodal,
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Ready for a new generation.
    #[default]
    Idle,
    /// A generation task is pending or running.
    Generating,
    /// New generations are refused. In-flight work keeps running.
    Paused,
    /// Stopped for good; only `reset` revives it.
    Stopped,
    /// The last generation failed.
    Error,
}

/// Outcome of one successful generation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    /// Task that produced it.
    pub task_id: TaskId,
    /// Generated text, cut before any stop sequence.
    pub text: String,
    /// Tokens sampled.
    pub tokens_generated: usize,
    /// Tokens in the evaluated prompt.
    pub prompt_tokens: usize,
    /// Wall-clock time inside the engine.
    pub duration: Duration,
    /// `tokens_generated / duration`.
    pub tokens_per_second: f64,
    /// Why generation ended.
    pub stop_reason: StopReason,
}

/// Running totals for a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Tokens generated across all successful generations.
    pub total_tokens_generated: u64,
    /// Prompt tokens evaluated across all successful generations.
    pub total_prompt_tokens: u64,
    /// Engine time across all successful generations.
    pub total_generation_time: Duration,
    /// Successful generations.
    pub generations: u64,
    /// Failed generations.
    pub failures: u64,
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session ID.
    pub id: SessionId,
    /// Session type.
    pub kind: SessionType,
    /// Current state.
    pub state: SessionState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation or generation.
    pub last_active_at: DateTime<Utc>,
    /// Messages in the history.
    pub message_count: usize,
    /// Tasks still outstanding for this session.
    pub active_tasks: usize,
    /// Running totals.
    pub stats: SessionStats,
}

/// Observer notification from one session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The session moved between states.
    StateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// A generation task was accepted.
    Started {
        /// Generation task.
        task_id: TaskId,
    },
    /// A new piece of generated text.
    Token {
        /// Generation task.
        task_id: TaskId,
        /// Text increment.
        text: String,
    },
    /// Fractional progress towards `max_tokens`.
    Progress {
        /// Generation task.
        task_id: TaskId,
        /// Value in `[0, 1]`.
        progress: f32,
    },
    /// A generation finished successfully.
    Completed {
        /// Generation task.
        task_id: TaskId,
        /// Its result.
        result: GenerationResult,
    },
    /// A generation failed.
    Failed {
        /// Generation task.
        task_id: TaskId,
        /// Why.
        error: KilnError,
    },
    /// A generation was cancelled.
    Cancelled {
        /// Generation task.
        task_id: TaskId,
    },
}

/// A problem found by
/// [`Session::validate_conversation_integrity`](crate::Session::validate_conversation_integrity).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "issue")]
pub enum IntegrityIssue {
    /// No user message in the history.
    NoUserMessages,
    /// No assistant message in the history.
    NoAssistantMessages,
    /// At least one user prompt, and no fewer assistant replies than prompts.
    ImbalancedTurns {
        /// User messages.
        user: usize,
        /// Assistant messages.
        assistant: usize,
    },
    /// A message with blank content.
    EmptyContent {
        /// Position in the history.
        index: usize,
    },
}
