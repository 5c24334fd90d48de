//! Context-window management settings.

use serde::{Deserialize, Serialize};

/// Policy deciding which historical messages survive when a conversation
/// exceeds its budget.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RetentionStrategy {
    /// No reduction at all.
    #[default]
    KeepAll,
    /// Keep the most recent `maxMessages` messages.
    SlidingWindow,
    /// Keep the system prompt and recent turns, compress older turns.
    SmartCompression,
    /// Keep the system prompt and recent turns, summarise older turns.
    SummaryBased,
    /// Fill the token budget newest-first.
    TokenBased,
}

/// How aggressively compressed messages are condensed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CompressionLevel {
    /// Leave messages as they are.
    None,
    /// Truncate and concatenate.
    Light,
    /// Numbered digest of excerpts.
    #[default]
    Medium,
    /// One sentence of topic fragments.
    Heavy,
}

/// Context-window defaults. Sessions may override any of these.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Retention strategy applied when over budget.
    pub retention_strategy: RetentionStrategy,
    /// Compression level used by compressing strategies.
    pub compression_level: CompressionLevel,
    /// Estimated-token budget.
    pub max_context_tokens: usize,
    /// Message-count budget.
    pub max_messages: usize,
    /// Trim oldest non-system messages after a strategy still leaves too many.
    pub enable_auto_cleanup: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            retention_strategy: RetentionStrategy::KeepAll,
            compression_level: CompressionLevel::Medium,
            max_context_tokens: 4096,
            max_messages: 100,
            enable_auto_cleanup: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&RetentionStrategy::SmartCompression).unwrap(),
            "\"smartCompression\""
        );
        let parsed: RetentionStrategy = serde_json::from_str("\"tokenBased\"").unwrap();
        assert_eq!(parsed, RetentionStrategy::TokenBased);
    }

    #[test]
    fn unknown_strategy_rejected() {
        assert!(serde_json::from_str::<RetentionStrategy>("\"lru\"").is_err());
    }
}
