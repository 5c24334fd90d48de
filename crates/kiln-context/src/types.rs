//! Context statistics, usage counters and observer events.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read-only breakdown of a message list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    /// All messages.
    pub total_messages: usize,
    /// User messages.
    pub user_messages: usize,
    /// Assistant messages.
    pub assistant_messages: usize,
    /// System messages.
    pub system_messages: usize,
    /// Tool messages.
    pub tool_messages: usize,
    /// Estimated tokens over all contents.
    pub estimated_tokens: usize,
    /// Token budget the estimate was compared against.
    pub max_context_tokens: usize,
    /// Whether the estimate exceeds the budget.
    pub exceeds_token_limit: bool,
}

/// Process-wide optimisation counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    /// Optimisations that changed the input.
    pub optimizations: u64,
    /// Messages dropped across all optimisations.
    pub messages_removed: u64,
    /// Messages folded into compressed or summary messages.
    pub messages_compressed: u64,
    /// Output/input token ratio of the last optimisation.
    pub last_compression_ratio: Option<f64>,
    /// When the last optimisation ran.
    pub last_optimized_at: Option<DateTime<Utc>>,
}

/// Observer notification from the context manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextEvent {
    /// An input exceeded the token budget.
    TokenLimitExceeded {
        /// Estimated tokens of the input.
        current: usize,
        /// Configured budget.
        limit: usize,
    },
    /// Older messages were compressed or summarised.
    MessagesCompressed {
        /// Messages folded.
        count: usize,
    },
    /// Messages were dropped.
    MessagesRemoved {
        /// Messages dropped.
        count: usize,
    },
}
