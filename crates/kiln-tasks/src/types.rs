//! Task vocabulary: kinds, priorities, lifecycle states, snapshots, events.

use chrono::{DateTime, Utc};
use kiln_core::{KilnError, TaskId};
use serde::{Deserialize, Serialize};

/// What a task does. Used for queries and bulk cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    /// Load model weights into the engine.
    ModelLoad,
    /// Token generation for a session.
    Generation,
    /// Compute an embedding vector.
    Embedding,
    /// Engine benchmark run.
    Benchmark,
    /// Tokenize or detokenize text.
    Tokenization,
    /// Generation with media inputs.
    Multimodal,
}

/// Scheduling priority. Higher variants start first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Regular work.
    #[default]
    Normal,
    /// User-facing work.
    High,
    /// Must start before anything else, e.g. model loads.
    Critical,
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Waiting for a free slot.
    Pending,
    /// Body is executing.
    Running,
    /// Body returned a value.
    Completed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Body returned an error or panicked.
    Failed,
}

impl TaskState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether `self → next` follows `Pending → Running → terminal`.
    ///
    /// A pending task may also be cancelled without ever running.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Cancelled | Self::Failed => false,
        }
    }
}

/// Point-in-time copy of a task's bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// What the task does.
    pub kind: TaskKind,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the body started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last reported progress in `[0, 1]`.
    pub progress: f32,
    /// Whether cancellation was requested.
    pub cancelled: bool,
    /// Failure reason for `Failed` tasks.
    #[serde(skip)]
    pub error: Option<KilnError>,
}

/// Counts of registered tasks by state plus processor flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    /// Tasks waiting to start.
    pub pending: usize,
    /// Tasks executing now.
    pub running: usize,
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that were cancelled.
    pub cancelled: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// All registered tasks.
    pub total: usize,
    /// Current concurrency cap.
    pub max_concurrent: usize,
    /// Accepting new submissions.
    pub is_running: bool,
    /// Starts are suspended.
    pub is_paused: bool,
}

/// Observer notification emitted by the processor.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    /// Task accepted into the pending set.
    Submitted {
        /// Task ID.
        id: TaskId,
        /// Task kind.
        kind: TaskKind,
        /// Task priority.
        priority: TaskPriority,
    },
    /// Body started on a worker.
    Started {
        /// Task ID.
        id: TaskId,
        /// Task kind.
        kind: TaskKind,
    },
    /// Body reported progress.
    Progress {
        /// Task ID.
        id: TaskId,
        /// Clamped progress.
        progress: f32,
    },
    /// Body returned a value.
    Completed {
        /// Task ID.
        id: TaskId,
    },
    /// Body failed.
    Failed {
        /// Task ID.
        id: TaskId,
        /// Failure reason.
        error: KilnError,
    },
    /// Task cancelled.
    Cancelled {
        /// Task ID.
        id: TaskId,
    },
}
