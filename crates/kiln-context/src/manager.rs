//! Central context manager.
//!
//! [`ContextManager`] decides which messages of a conversation survive when
//! it exceeds its token or message budget. It holds global defaults but no
//! per-conversation state: every operation takes the message list
//! explicitly, and sessions with their own policy pass their settings to
//! [`ContextManager::optimize_with`].

use chrono::Utc;
use kiln_core::{EventEmitter, Message, Role};
use kiln_settings::{ContextSettings, RetentionStrategy};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::compression;
use crate::constants::{SMART_COMPRESSION_RECENT, SUMMARY_RECENT};
use crate::estimator::TokenEstimator;
use crate::types::{ContextEvent, ContextStats, ContextUsage};

// =============================================================================
// ContextManager
// =============================================================================

/// Token-budget enforcement over message lists.
pub struct ContextManager {
    settings: RwLock<ContextSettings>,
    estimator: TokenEstimator,
    usage: Mutex<ContextUsage>,
    events: EventEmitter<ContextEvent>,
}

impl ContextManager {
    /// Create a manager with the given global defaults.
    pub fn new(settings: ContextSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            estimator: TokenEstimator::new(),
            usage: Mutex::new(ContextUsage::default()),
            events: EventEmitter::new(),
        }
    }

    /// Current global defaults.
    pub fn settings(&self) -> ContextSettings {
        self.settings.read().clone()
    }

    /// Replace the global defaults.
    pub fn set_settings(&self, settings: ContextSettings) {
        *self.settings.write() = settings;
    }

    // ── Estimation ──────────────────────────────────────────────────

    /// Estimated tokens for `text`.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Estimated tokens for every message's content.
    pub fn estimate_message_tokens(&self, messages: &[Message]) -> usize {
        self.estimator.estimate_messages(messages)
    }

    /// Whether `messages` exceed the global token budget.
    pub fn would_exceed_token_limit(&self, messages: &[Message]) -> bool {
        let limit = self.settings.read().max_context_tokens;
        self.estimate_message_tokens(messages) > limit
    }

    fn needs_optimization(&self, settings: &ContextSettings, messages: &[Message]) -> bool {
        messages.len() > settings.max_messages
            || self.estimate_message_tokens(messages) > settings.max_context_tokens
    }

    // ── Optimisation ────────────────────────────────────────────────

    /// Reduce `messages` to the global budget.
    pub fn get_optimized_context(&self, messages: &[Message]) -> Vec<Message> {
        let settings = self.settings();
        self.optimize_with(&settings, messages)
    }

    /// Reduce `messages` to the budget described by `settings`.
    ///
    /// Within budget the input is returned unchanged. Otherwise the retention
    /// strategy runs, followed by auto-cleanup when it is enabled and the
    /// result still has too many messages.
    pub fn optimize_with(&self, settings: &ContextSettings, messages: &[Message]) -> Vec<Message> {
        if !self.needs_optimization(settings, messages)
            || settings.retention_strategy == RetentionStrategy::KeepAll
        {
            return messages.to_vec();
        }

        let tokens_before = self.estimate_message_tokens(messages);
        if tokens_before > settings.max_context_tokens {
            let _ = self.events.emit(ContextEvent::TokenLimitExceeded {
                current: tokens_before,
                limit: settings.max_context_tokens,
            });
        }

        let (mut out, folded) = match settings.retention_strategy {
            RetentionStrategy::KeepAll => (messages.to_vec(), 0),
            RetentionStrategy::SlidingWindow => (sliding_window(messages, settings.max_messages), 0),
            RetentionStrategy::SmartCompression => smart_compression(settings, messages),
            RetentionStrategy::SummaryBased => summary_based(messages),
            RetentionStrategy::TokenBased => (self.token_based(settings, messages), 0),
        };

        if settings.enable_auto_cleanup && out.len() > settings.max_messages {
            let _ = trim_oldest_non_system(&mut out, settings.max_messages);
        }

        let removed = messages.len().saturating_sub(out.len());
        let tokens_after = self.estimate_message_tokens(&out);
        self.record_optimization(folded, removed, tokens_before, tokens_after);
        debug!(
            strategy = ?settings.retention_strategy,
            before = messages.len(),
            after = out.len(),
            tokens_before,
            tokens_after,
            "context optimized"
        );
        out
    }

    fn token_based(&self, settings: &ContextSettings, messages: &[Message]) -> Vec<Message> {
        let budget = settings.max_context_tokens;
        let system_idx = messages.iter().position(Message::is_system);

        let mut used = 0;
        let mut head = None;
        if let Some(idx) = system_idx {
            let cost = self.estimate_tokens(&messages[idx].content);
            if cost <= budget {
                used = cost;
                head = Some(messages[idx].clone());
            }
        }

        let mut tail = Vec::new();
        for (idx, message) in messages.iter().enumerate().rev() {
            if Some(idx) == system_idx {
                continue;
            }
            let cost = self.estimate_tokens(&message.content);
            if used + cost > budget {
                break;
            }
            used += cost;
            tail.push(message.clone());
        }
        tail.reverse();

        head.into_iter().chain(tail).collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_optimization(&self, folded: usize, removed: usize, before: usize, after: usize) {
        if folded > 0 {
            let _ = self.events.emit(ContextEvent::MessagesCompressed { count: folded });
        }
        if removed > 0 {
            let _ = self.events.emit(ContextEvent::MessagesRemoved { count: removed });
        }
        let mut usage = self.usage.lock();
        usage.optimizations += 1;
        usage.messages_compressed += folded as u64;
        usage.messages_removed += removed as u64;
        if before > 0 {
            usage.last_compression_ratio = Some(after as f64 / before as f64);
        }
        usage.last_optimized_at = Some(Utc::now());
    }

    // ── Compression ─────────────────────────────────────────────────

    /// Compress `messages` at the global compression level.
    pub fn compress_messages(&self, messages: &[Message]) -> Vec<Message> {
        let level = self.settings.read().compression_level;
        compression::compress(level, messages)
    }

    /// The synthetic system message the summary strategy substitutes for
    /// older turns.
    pub fn create_summary(&self, messages: &[Message]) -> Message {
        compression::summarize(messages)
    }

    /// Trim the oldest non-system messages until at most `maxMessages`
    /// remain. System messages are always kept. Returns how many were removed.
    pub fn cleanup_old_messages(&self, messages: &mut Vec<Message>) -> usize {
        let max = self.settings.read().max_messages;
        let removed = trim_oldest_non_system(messages, max);
        if removed > 0 {
            let _ = self.events.emit(ContextEvent::MessagesRemoved { count: removed });
            self.usage.lock().messages_removed += removed as u64;
        }
        removed
    }

    // ── Importance ──────────────────────────────────────────────────

    /// System prompts, tool traffic and questions are worth keeping.
    pub fn is_message_important(message: &Message) -> bool {
        matches!(message.role, Role::System | Role::Tool)
            || message.tool_call.is_some()
            || message.content.contains('?')
    }

    /// The important subset of `messages`, in order.
    pub fn filter_important(messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .filter(|m| Self::is_message_important(m))
            .cloned()
            .collect()
    }

    // ── Statistics ──────────────────────────────────────────────────

    /// Breakdown of `messages` against the global budget.
    pub fn context_stats(&self, messages: &[Message]) -> ContextStats {
        let limit = self.settings.read().max_context_tokens;
        self.stats_with(limit, messages)
    }

    /// Breakdown of `messages` against `max_context_tokens`.
    pub fn stats_with(&self, max_context_tokens: usize, messages: &[Message]) -> ContextStats {
        let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
        let estimated_tokens = self.estimate_message_tokens(messages);
        ContextStats {
            total_messages: messages.len(),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            system_messages: count(Role::System),
            tool_messages: count(Role::Tool),
            estimated_tokens,
            max_context_tokens,
            exceeds_token_limit: estimated_tokens > max_context_tokens,
        }
    }

    /// Optimisation counters since creation or the last reset.
    pub fn usage(&self) -> ContextUsage {
        self.usage.lock().clone()
    }

    /// Zero the optimisation counters.
    pub fn reset_statistics(&self) {
        *self.usage.lock() = ContextUsage::default();
    }

    /// Subscribe to context events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextSettings::default())
    }
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("settings", &*self.settings.read())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Strategy helpers
// =============================================================================

fn sliding_window(messages: &[Message], max_messages: usize) -> Vec<Message> {
    messages[messages.len().saturating_sub(max_messages)..].to_vec()
}

fn smart_compression(settings: &ContextSettings, messages: &[Message]) -> (Vec<Message>, usize) {
    let (system, older, recent) = split_recent(messages, SMART_COMPRESSION_RECENT);
    let mut out: Vec<Message> = system.into_iter().collect();
    out.extend(compression::compress(settings.compression_level, &older));
    out.extend(recent);
    (out, older.len())
}

fn summary_based(messages: &[Message]) -> (Vec<Message>, usize) {
    let (system, older, recent) = split_recent(messages, SUMMARY_RECENT);
    let mut out: Vec<Message> = system.into_iter().collect();
    if !older.is_empty() {
        out.push(compression::summarize(&older));
    }
    out.extend(recent);
    (out, older.len())
}

/// Split into (first system message, older non-system, most recent
/// `keep` non-system). Later system messages are dropped.
fn split_recent(messages: &[Message], keep: usize) -> (Option<Message>, Vec<Message>, Vec<Message>) {
    let system = messages.iter().find(|m| m.is_system()).cloned();
    let mut rest: Vec<Message> = messages.iter().filter(|m| !m.is_system()).cloned().collect();
    let recent = rest.split_off(rest.len().saturating_sub(keep));
    (system, rest, recent)
}

fn trim_oldest_non_system(messages: &mut Vec<Message>, max: usize) -> usize {
    let excess = messages.len().saturating_sub(max);
    if excess == 0 {
        return 0;
    }
    let mut to_drop = excess;
    messages.retain(|m| {
        if to_drop > 0 && !m.is_system() {
            to_drop -= 1;
            false
        } else {
            true
        }
    });
    excess - to_drop
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
