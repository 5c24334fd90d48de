//! One logical conversation over the shared engine.
//!
//! A [`Session`] owns its message history, generation settings and running
//! totals behind a single reader/writer lock. Generation work is handed to
//! the [`TaskProcessor`]; the engine is only touched from inside those task
//! bodies, never while the session lock is held.

mod generation;
pub mod integrity;
pub mod types;

pub use generation::GenerationHandlers;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_context::{ContextManager, ContextStats};
use kiln_core::{EventEmitter, KilnError, Message, Role, SessionId, TaskId, ToolSpec};
use kiln_engine::EngineHandle;
use kiln_settings::{CompressionLevel, ContextSettings, GenerationConfig, RetentionStrategy};
use kiln_tasks::TaskProcessor;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use self::integrity::{has_valid_flow, integrity_issues};
use self::types::{
    IntegrityIssue, SessionEvent, SessionSnapshot, SessionState, SessionStats, SessionType,
};

/// Services shared by every session of a runtime.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) processor: Arc<TaskProcessor>,
    pub(crate) engine: Arc<EngineHandle>,
    pub(crate) context: Arc<ContextManager>,
}

type StateChange = (SessionState, SessionState);

struct SessionInner {
    state: SessionState,
    last_active_at: DateTime<Utc>,
    messages: Vec<Message>,
    config: GenerationConfig,
    system_prompt: Option<String>,
    tools: Vec<ToolSpec>,
    context: ContextSettings,
    smart_context: bool,
    stats: SessionStats,
    active_tasks: HashSet<TaskId>,
    generation: Option<TaskId>,
}

impl SessionInner {
    fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    fn set_state(&mut self, to: SessionState) -> Option<StateChange> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some((from, to))
    }

    /// Drop the generation slot and leave `Generating` if it was held.
    fn release_generation(&mut self) -> Option<StateChange> {
        self.generation = None;
        if self.state == SessionState::Generating {
            self.set_state(SessionState::Idle)
        } else {
            None
        }
    }
}

/// A conversation or generation context.
///
/// Obtained from a [`SessionRegistry`](crate::SessionRegistry). Methods that
/// submit work take `self: &Arc<Self>` so task callbacks can reach the
/// session after the caller has moved on.
pub struct Session {
    id: SessionId,
    kind: SessionType,
    created_at: DateTime<Utc>,
    services: Services,
    inner: RwLock<SessionInner>,
    events: EventEmitter<SessionEvent>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        kind: SessionType,
        config: GenerationConfig,
        services: Services,
    ) -> Arc<Self> {
        let now = Utc::now();
        let context = services.context.settings();
        Arc::new(Self {
            id,
            kind,
            created_at: now,
            services,
            inner: RwLock::new(SessionInner {
                state: SessionState::Idle,
                last_active_at: now,
                messages: Vec::new(),
                config,
                system_prompt: None,
                tools: Vec::new(),
                context,
                smart_context: true,
                stats: SessionStats::default(),
                active_tasks: HashSet::new(),
                generation: None,
            }),
            events: EventEmitter::new(),
        })
    }

    // ── Identity and state ──────────────────────────────────────────

    /// Session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Session type.
    pub fn kind(&self) -> SessionType {
        self.kind
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Last mutation or generation.
    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.inner.read().last_active_at
    }

    /// Whether a generation task is outstanding.
    pub fn is_generating(&self) -> bool {
        self.inner.read().generation.is_some()
    }

    /// Tasks submitted by this session that have not finished.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.inner.read().active_tasks.iter().cloned().collect()
    }

    /// Running totals.
    pub fn stats(&self) -> SessionStats {
        self.inner.read().stats
    }

    /// Point-in-time view.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        SessionSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            state: inner.state,
            created_at: self.created_at,
            last_active_at: inner.last_active_at,
            message_count: inner.messages.len(),
            active_tasks: inner.active_tasks.len(),
            stats: inner.stats,
        }
    }

    /// Subscribe to this session's events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.emit(event);
    }

    fn emit_change(&self, change: Option<StateChange>) {
        if let Some((from, to)) = change {
            debug!(session_id = %self.id, ?from, ?to, "session state changed");
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    // ── Configuration ───────────────────────────────────────────────

    /// Sampling parameters used by the next generation.
    pub fn generation_config(&self) -> GenerationConfig {
        self.inner.read().config.clone()
    }

    /// Replace the sampling parameters.
    pub fn set_generation_config(&self, config: GenerationConfig) {
        self.inner.write().config = config;
    }

    /// System prompt prepended to every generation.
    pub fn system_prompt(&self) -> Option<String> {
        self.inner.read().system_prompt.clone()
    }

    /// Set or clear the system prompt.
    pub fn set_system_prompt(&self, prompt: Option<String>) {
        self.inner.write().system_prompt = prompt;
    }

    /// Tools advertised to the model.
    pub fn tools(&self) -> Vec<ToolSpec> {
        self.inner.read().tools.clone()
    }

    /// Replace the advertised tools.
    pub fn set_tools(&self, tools: Vec<ToolSpec>) {
        self.inner.write().tools = tools;
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Refuse new generations. Work already submitted keeps running.
    pub fn pause(&self) {
        let change = {
            let mut inner = self.inner.write();
            match inner.state {
                SessionState::Stopped | SessionState::Paused => None,
                _ => inner.set_state(SessionState::Paused),
            }
        };
        self.emit_change(change);
    }

    /// Accept generations again after [`pause`](Self::pause).
    pub fn resume(&self) {
        let change = {
            let mut inner = self.inner.write();
            if inner.state == SessionState::Paused {
                let to = if inner.generation.is_some() {
                    SessionState::Generating
                } else {
                    SessionState::Idle
                };
                inner.set_state(to)
            } else {
                None
            }
        };
        self.emit_change(change);
    }

    /// Cancel everything outstanding and refuse further work.
    pub fn stop(&self) {
        let (tasks, change) = {
            let mut inner = self.inner.write();
            let tasks: Vec<TaskId> = inner.active_tasks.drain().collect();
            inner.generation = None;
            (tasks, inner.set_state(SessionState::Stopped))
        };
        let cancelled = self.cancel_tasks(&tasks);
        debug!(session_id = %self.id, cancelled, "session stopped");
        self.emit_change(change);
    }

    /// Cancel outstanding work, clear history and totals, return to `Idle`.
    pub fn reset(&self) {
        let (tasks, change) = {
            let mut inner = self.inner.write();
            let tasks: Vec<TaskId> = inner.active_tasks.drain().collect();
            inner.generation = None;
            inner.messages.clear();
            inner.stats = SessionStats::default();
            inner.touch();
            (tasks, inner.set_state(SessionState::Idle))
        };
        let _ = self.cancel_tasks(&tasks);
        self.emit_change(change);
    }

    fn cancel_tasks(&self, tasks: &[TaskId]) -> usize {
        tasks
            .iter()
            .filter(|id| self.services.processor.cancel(id))
            .count()
    }

    // ── History ─────────────────────────────────────────────────────

    /// Append one message.
    pub fn add_message(&self, message: Message) {
        let mut inner = self.inner.write();
        inner.messages.push(message);
        inner.touch();
    }

    /// Append several messages in order.
    pub fn add_messages<I>(&self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        let mut inner = self.inner.write();
        inner.messages.extend(messages);
        inner.touch();
    }

    /// The full history.
    pub fn conversation_history(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// User messages, in order.
    pub fn user_messages(&self) -> Vec<Message> {
        self.messages_with_role(Role::User)
    }

    /// Assistant messages, in order.
    pub fn assistant_messages(&self) -> Vec<Message> {
        self.messages_with_role(Role::Assistant)
    }

    fn messages_with_role(&self, role: Role) -> Vec<Message> {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| m.role == role)
            .cloned()
            .collect()
    }

    /// Number of messages in the history.
    pub fn message_count(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// Remove every message.
    pub fn clear_history(&self) {
        let mut inner = self.inner.write();
        inner.messages.clear();
        inner.touch();
    }

    /// Remove and return the newest message.
    pub fn remove_last_message(&self) -> Option<Message> {
        let mut inner = self.inner.write();
        let removed = inner.messages.pop();
        if removed.is_some() {
            inner.touch();
        }
        removed
    }

    /// Remove and return the message at `index`.
    pub fn remove_message_at(&self, index: usize) -> kiln_core::Result<Message> {
        let mut inner = self.inner.write();
        let len = inner.messages.len();
        if index >= len {
            return Err(KilnError::invalid_argument(format!(
                "message index {index} out of range for {len} messages"
            )));
        }
        inner.touch();
        Ok(inner.messages.remove(index))
    }

    /// Keep only the newest `keep_last` messages. Returns how many went.
    pub fn clear_old_messages(&self, keep_last: usize) -> usize {
        let mut inner = self.inner.write();
        let excess = inner.messages.len().saturating_sub(keep_last);
        if excess > 0 {
            let _ = inner.messages.drain(..excess);
            inner.touch();
        }
        excess
    }

    // ── Context management ──────────────────────────────────────────

    /// Whether generations optimise the history before prompting.
    pub fn smart_context_management(&self) -> bool {
        self.inner.read().smart_context
    }

    /// Turn history optimisation on or off.
    pub fn set_smart_context_management(&self, enabled: bool) {
        self.inner.write().smart_context = enabled;
    }

    /// This session's context policy.
    pub fn context_settings(&self) -> ContextSettings {
        self.inner.read().context.clone()
    }

    /// Replace this session's context policy.
    pub fn set_context_settings(&self, settings: ContextSettings) {
        self.inner.write().context = settings;
    }

    /// Token budget for the optimised history.
    pub fn set_max_context_tokens(&self, max_tokens: usize) -> kiln_core::Result<()> {
        if max_tokens == 0 {
            return Err(KilnError::invalid_argument("maxContextTokens must be positive"));
        }
        self.inner.write().context.max_context_tokens = max_tokens;
        Ok(())
    }

    /// Retention strategy for the optimised history.
    pub fn set_retention_strategy(&self, strategy: RetentionStrategy) {
        self.inner.write().context.retention_strategy = strategy;
    }

    /// Compression level used by `SmartCompression`.
    pub fn set_compression_level(&self, level: CompressionLevel) {
        self.inner.write().context.compression_level = level;
    }

    /// The history as the next generation would see it.
    pub fn optimized_history(&self) -> Vec<Message> {
        let (settings, messages) = {
            let inner = self.inner.read();
            (inner.context.clone(), inner.messages.clone())
        };
        self.services.context.optimize_with(&settings, &messages)
    }

    /// Replace the history with its optimised form. Returns how many
    /// messages the history shrank by.
    ///
    /// Messages appended while the optimisation ran are kept after the
    /// optimised prefix. Any other concurrent edit leaves the history as is.
    pub fn compress_history(&self) -> usize {
        let (settings, snapshot) = {
            let inner = self.inner.read();
            (inner.context.clone(), inner.messages.clone())
        };
        let optimized = self.services.context.optimize_with(&settings, &snapshot);

        let mut inner = self.inner.write();
        if !inner.messages.starts_with(&snapshot) {
            debug!(session_id = %self.id, "history changed during compression, skipping");
            return 0;
        }
        let before = inner.messages.len();
        let appended = inner.messages.split_off(snapshot.len());
        inner.messages = optimized;
        inner.messages.extend(appended);
        inner.touch();
        before.saturating_sub(inner.messages.len())
    }

    /// Counts and token estimate for the current history.
    pub fn context_stats(&self) -> ContextStats {
        let (max_tokens, messages) = {
            let inner = self.inner.read();
            (inner.context.max_context_tokens, inner.messages.clone())
        };
        self.services.context.stats_with(max_tokens, &messages)
    }

    // ── Integrity ───────────────────────────────────────────────────

    /// Log every shape problem in the history and return them.
    pub fn validate_conversation_integrity(&self) -> Vec<IntegrityIssue> {
        let issues = integrity_issues(&self.inner.read().messages);
        for issue in &issues {
            warn!(session_id = %self.id, ?issue, "conversation integrity issue");
        }
        issues
    }

    /// Whether the history strictly alternates user and assistant turns,
    /// ignoring system messages.
    pub fn has_valid_conversation_flow(&self) -> bool {
        has_valid_flow(&self.inner.read().messages)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kiln_core::logging::capture_logs;
    use kiln_engine::testing::ScriptedBackend;
    use kiln_settings::ModelConfig;
    use tracing::Level;

    pub(crate) fn services(backend: ScriptedBackend) -> Services {
        let engine = EngineHandle::new(Box::new(backend));
        engine
            .load_model(&ModelConfig::with_model_path("/models/test.gguf"))
            .unwrap();
        Services {
            processor: Arc::new(TaskProcessor::new(2)),
            engine: Arc::new(engine),
            context: Arc::new(ContextManager::default()),
        }
    }

    fn chat() -> Arc<Session> {
        Session::new(
            SessionId::new(),
            SessionType::Chat,
            GenerationConfig::default(),
            services(ScriptedBackend::new(["ok"])),
        )
    }

    #[tokio::test]
    async fn history_mutations() {
        let session = chat();
        session.add_message(Message::user("one"));
        session.add_messages([Message::assistant("two"), Message::user("three")]);
        assert_eq!(session.message_count(), 3);
        assert_eq!(session.user_messages().len(), 2);
        assert_eq!(session.assistant_messages(), [Message::assistant("two")]);

        assert_eq!(session.remove_last_message(), Some(Message::user("three")));
        assert_eq!(session.remove_message_at(0).unwrap(), Message::user("one"));
        assert_matches!(
            session.remove_message_at(5),
            Err(KilnError::InvalidArgument(_))
        );
        session.clear_history();
        assert_eq!(session.remove_last_message(), None);
    }

    #[tokio::test]
    async fn clear_old_messages_keeps_newest() {
        let session = chat();
        session.add_messages((0..5).map(|i| Message::user(format!("m{i}"))));
        assert_eq!(session.clear_old_messages(2), 3);
        assert_eq!(
            session.conversation_history(),
            [Message::user("m3"), Message::user("m4")]
        );
        assert_eq!(session.clear_old_messages(10), 0);
    }

    #[tokio::test]
    async fn pause_resume_stop_transitions() {
        let session = chat();
        let mut events = session.subscribe();
        session.pause();
        assert_eq!(session.state(), SessionState::Paused);
        session.resume();
        assert_eq!(session.state(), SessionState::Idle);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        session.pause();
        assert_eq!(session.state(), SessionState::Stopped);

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            SessionEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Paused
            }
        );
    }

    #[tokio::test]
    async fn reset_clears_and_revives() {
        let session = chat();
        session.add_message(Message::user("hi"));
        session.stop();
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.message_count(), 0);
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[tokio::test]
    async fn context_knobs() {
        let session = chat();
        assert!(session.smart_context_management());
        session.set_smart_context_management(false);
        assert!(!session.smart_context_management());

        session.set_retention_strategy(RetentionStrategy::SlidingWindow);
        session.set_compression_level(CompressionLevel::Heavy);
        session.set_max_context_tokens(64).unwrap();
        assert_matches!(
            session.set_max_context_tokens(0),
            Err(KilnError::InvalidArgument(_))
        );
        let settings = session.context_settings();
        assert_eq!(settings.retention_strategy, RetentionStrategy::SlidingWindow);
        assert_eq!(settings.compression_level, CompressionLevel::Heavy);
        assert_eq!(settings.max_context_tokens, 64);
    }

    #[tokio::test]
    async fn sliding_window_history_and_compression() {
        let session = chat();
        session.set_context_settings(ContextSettings {
            retention_strategy: RetentionStrategy::SlidingWindow,
            max_messages: 3,
            ..ContextSettings::default()
        });
        session.add_messages((1..=5).map(|i| Message::user(format!("m{i}"))));

        let optimized = session.optimized_history();
        assert_eq!(optimized.len(), 3);
        assert_eq!(optimized[0].content, "m3");
        assert_eq!(session.message_count(), 5);

        assert_eq!(session.compress_history(), 2);
        assert_eq!(session.conversation_history(), optimized);
    }

    #[tokio::test]
    async fn context_stats_use_session_budget() {
        let session = chat();
        session.set_max_context_tokens(16).unwrap();
        session.add_messages([Message::system("be brief"), Message::user("a".repeat(100))]);
        let stats = session.context_stats();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.system_messages, 1);
        assert_eq!(stats.max_context_tokens, 16);
        assert!(stats.exceeds_token_limit);
    }

    #[tokio::test]
    async fn integrity_issues_are_logged() {
        let session = chat();
        session.add_messages([Message::user("hi"), Message::user("")]);
        let (logs, _guard) = capture_logs();
        let issues = session.validate_conversation_integrity();
        assert!(issues.contains(&IntegrityIssue::NoAssistantMessages));
        assert!(issues.contains(&IntegrityIssue::EmptyContent { index: 1 }));
        assert_eq!(logs.count_at_level(Level::WARN), issues.len());
        assert!(!session.has_valid_conversation_flow());
    }

    #[tokio::test]
    async fn snapshot_reflects_state() {
        let session = chat();
        session.add_message(Message::user("hi"));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.id, *session.id());
        assert_eq!(snapshot.kind, SessionType::Chat);
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.active_tasks, 0);
    }
}
