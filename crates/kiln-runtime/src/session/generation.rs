//! Generation, embedding and cancellation for a [`Session`].

use std::fmt::Write;
use std::sync::Arc;

use kiln_context::ContextManager;
use kiln_core::{KilnError, Message, TaskId, ToolSpec};
use kiln_engine::{CompletionRequest, tokens_per_second};
use kiln_settings::{ContextSettings, GenerationConfig};
use kiln_tasks::{Task, TaskCompletion, TaskContext, TaskKind, TaskPriority};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use super::types::{GenerationResult, SessionEvent, SessionState, SessionType};
use super::{Session, SessionInner};

type TokenFn = Arc<Mutex<Box<dyn FnMut(&str) + Send>>>;
type ProgressFn = Box<dyn FnMut(f32) + Send>;
type CompleteFn = Box<dyn FnOnce(TaskCompletion<GenerationResult>) + Send>;

/// Callbacks for one generation. All run on the task processor's delivery
/// dispatcher, in order, never under a session lock.
#[derive(Default)]
pub struct GenerationHandlers {
    on_token: Option<TokenFn>,
    on_progress: Option<ProgressFn>,
    on_complete: Option<CompleteFn>,
}

impl GenerationHandlers {
    /// No callbacks; observe through [`Session::subscribe`] instead.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only a completion callback.
    pub fn completion<F>(f: F) -> Self
    where
        F: FnOnce(TaskCompletion<GenerationResult>) + Send + 'static,
    {
        Self::new().on_complete(f)
    }

    /// Called with each new piece of text.
    #[must_use]
    pub fn on_token<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_token = Some(Arc::new(Mutex::new(Box::new(f))));
        self
    }

    /// Called with progress towards `max_tokens`.
    #[must_use]
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called exactly once when the generation ends.
    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TaskCompletion<GenerationResult>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for GenerationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandlers")
            .field("on_token", &self.on_token.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Everything a generation body needs, captured at submission.
struct PromptSnapshot {
    kind: SessionType,
    messages: Vec<Message>,
    preamble: Option<String>,
    config: GenerationConfig,
    context: ContextSettings,
    smart_context: bool,
    media_paths: Vec<String>,
}

impl PromptSnapshot {
    fn capture(inner: &SessionInner, kind: SessionType, media_paths: Vec<String>) -> Self {
        Self {
            kind,
            messages: inner.messages.clone(),
            preamble: system_preamble(inner.system_prompt.as_deref(), &inner.tools),
            config: inner.config.clone(),
            context: inner.context.clone(),
            smart_context: inner.smart_context,
            media_paths,
        }
    }

    /// History after optimisation, with the system preamble in front.
    fn prompt_messages(&self, context: &ContextManager) -> Vec<Message> {
        let mut messages = if self.smart_context {
            context.optimize_with(&self.context, &self.messages)
        } else {
            self.messages.clone()
        };
        if let Some(preamble) = &self.preamble {
            messages.insert(0, Message::system(preamble.clone()));
        }
        messages
    }
}

/// System prompt followed by a listing of the advertised tools.
fn system_preamble(system_prompt: Option<&str>, tools: &[ToolSpec]) -> Option<String> {
    if tools.is_empty() {
        return system_prompt.map(str::to_owned);
    }
    let mut preamble = system_prompt.map(str::to_owned).unwrap_or_default();
    if !preamble.is_empty() {
        preamble.push_str("\n\n");
    }
    preamble.push_str("Available tools:");
    for tool in tools {
        let _ = write!(preamble, "\n- {}: {}", tool.name, tool.description);
    }
    Some(preamble)
}

/// Raw completion prompt: message contents one per line.
fn raw_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[allow(clippy::cast_precision_loss)]
fn fraction(done: usize, total: usize) -> f32 {
    done as f32 / total.max(1) as f32
}

impl Session {
    // ── Admission ───────────────────────────────────────────────────

    fn check_accepting(&self, inner: &SessionInner) -> kiln_core::Result<()> {
        match inner.state {
            SessionState::Stopped => Err(KilnError::invalid_state("session is stopped")),
            SessionState::Paused => Err(KilnError::invalid_state("session is paused")),
            _ if !self.services.engine.is_loaded() => Err(KilnError::ModelNotLoaded),
            _ => Ok(()),
        }
    }

    // ── Generation ──────────────────────────────────────────────────

    /// Generate a reply to the current history.
    ///
    /// Rejected synchronously, without touching the engine, when the session
    /// is already generating, paused, stopped, or no model is loaded. A
    /// rejected call never invokes the handlers.
    pub fn generate_response(
        self: &Arc<Self>,
        handlers: GenerationHandlers,
    ) -> kiln_core::Result<TaskId> {
        self.start_generation(TaskKind::Generation, None, Vec::new(), handlers)
    }

    /// Append `prompt` as a user message, then generate.
    ///
    /// The message is only appended if the generation is accepted.
    pub fn generate_completion_for_prompt(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        handlers: GenerationHandlers,
    ) -> kiln_core::Result<TaskId> {
        let message = Message::user(prompt);
        self.start_generation(TaskKind::Generation, Some(message), Vec::new(), handlers)
    }

    /// Generate from `prompt` plus images or audio.
    ///
    /// Fails with [`KilnError::MultimodalNotEnabled`] when the engine has no
    /// projector loaded.
    pub fn generate_multimodal(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        media_paths: Vec<String>,
        handlers: GenerationHandlers,
    ) -> kiln_core::Result<TaskId> {
        if !self.services.engine.is_multimodal_enabled() {
            return Err(KilnError::MultimodalNotEnabled);
        }
        let message = Message::user(prompt);
        self.start_generation(TaskKind::Multimodal, Some(message), media_paths, handlers)
    }

    #[instrument(skip_all, fields(session_id = %self.id, kind = ?kind))]
    fn start_generation(
        self: &Arc<Self>,
        kind: TaskKind,
        append: Option<Message>,
        media_paths: Vec<String>,
        handlers: GenerationHandlers,
    ) -> kiln_core::Result<TaskId> {
        let GenerationHandlers {
            on_token,
            on_progress,
            on_complete,
        } = handlers;

        let (task, appended, change) = {
            let mut inner = self.inner.write();
            self.check_accepting(&inner)?;
            if inner.generation.is_some() {
                warn!("generation already in progress, rejecting");
                return Err(KilnError::invalid_state("generation already in progress"));
            }
            let appended = append.is_some();
            if let Some(message) = append {
                inner.messages.push(message);
            }
            let snapshot = PromptSnapshot::capture(&inner, self.kind, media_paths);
            let task = self.generation_task(kind, snapshot, on_token, on_progress, on_complete);
            let _ = inner.active_tasks.insert(task.id().clone());
            inner.generation = Some(task.id().clone());
            inner.touch();
            (task, appended, inner.set_state(SessionState::Generating))
        };

        let task_id = task.id().clone();
        self.emit_change(change);
        if self.services.processor.submit(task).is_none() {
            let change = {
                let mut inner = self.inner.write();
                let _ = inner.active_tasks.remove(&task_id);
                if appended {
                    let _ = inner.messages.pop();
                }
                inner.release_generation()
            };
            self.emit_change(change);
            return Err(KilnError::invalid_state("task processor is not accepting work"));
        }
        debug!(task_id = %task_id, "generation submitted");
        self.emit(SessionEvent::Started {
            task_id: task_id.clone(),
        });
        Ok(task_id)
    }

    fn generation_task(
        self: &Arc<Self>,
        kind: TaskKind,
        snapshot: PromptSnapshot,
        on_token: Option<TokenFn>,
        mut on_progress: Option<ProgressFn>,
        on_complete: Option<CompleteFn>,
    ) -> Task<GenerationResult> {
        let session = Arc::clone(self);
        let body = move |ctx: &TaskContext| session.run_generation(ctx, &snapshot, on_token.as_ref());

        let task = Task::new(kind, TaskPriority::Normal, body)
            .with_description(format!("generation for session {}", self.id));
        let task_id = task.id().clone();

        let session = Arc::clone(self);
        let progress_id = task_id.clone();
        let task = task.on_progress(move |progress| {
            session.emit(SessionEvent::Progress {
                task_id: progress_id.clone(),
                progress,
            });
            if let Some(handler) = on_progress.as_mut() {
                handler(progress);
            }
        });

        let session = Arc::clone(self);
        task.on_complete(move |completion| {
            session.finish_generation(&task_id, completion, on_complete);
        })
    }

    /// Task body: runs on a worker thread with the engine leased.
    fn run_generation(
        &self,
        ctx: &TaskContext,
        snapshot: &PromptSnapshot,
        on_token: Option<&TokenFn>,
    ) -> kiln_core::Result<GenerationResult> {
        let messages = snapshot.prompt_messages(&self.services.context);
        let mut lease = self.services.engine.lease()?;
        let prompt = match snapshot.kind {
            SessionType::Completion => raw_prompt(&messages),
            _ => lease.format_chat(&messages, None),
        };

        let max_tokens = snapshot.config.max_tokens;
        let mut pieces = 0usize;
        let output = lease.complete(
            CompletionRequest {
                prompt: &prompt,
                media_paths: &snapshot.media_paths,
                config: &snapshot.config,
            },
            || ctx.is_cancelled(),
            |piece| {
                pieces += 1;
                self.emit(SessionEvent::Token {
                    task_id: ctx.id().clone(),
                    text: piece.to_owned(),
                });
                if let Some(handler) = on_token {
                    let handler = Arc::clone(handler);
                    let piece = piece.to_owned();
                    ctx.deliver(move || {
                        let mut callback = handler.lock();
                        (*callback)(&piece);
                    });
                }
                if let Some(max) = max_tokens {
                    ctx.report_progress(fraction(pieces, max));
                }
            },
        )?;
        drop(lease);

        ctx.report_progress(1.0);
        Ok(GenerationResult {
            task_id: ctx.id().clone(),
            tokens_per_second: tokens_per_second(output.tokens_generated, output.elapsed),
            text: output.text,
            tokens_generated: output.tokens_generated,
            prompt_tokens: output.prompt_tokens,
            duration: output.elapsed,
            stop_reason: output.stop_reason,
        })
    }

    /// Completion callback: runs on the delivery dispatcher.
    fn finish_generation(
        &self,
        task_id: &TaskId,
        completion: TaskCompletion<GenerationResult>,
        on_complete: Option<CompleteFn>,
    ) {
        let change = {
            let mut inner = self.inner.write();
            // A task released by reset, stop or cancel no longer belongs to
            // this history, even if its body finished first.
            let owned = inner.active_tasks.remove(task_id);
            let current = inner.generation.as_ref() == Some(task_id);
            if current {
                inner.generation = None;
            }
            inner.touch();
            let next = match &completion {
                _ if !owned => SessionState::Idle,
                TaskCompletion::Completed(result) => {
                    if self.kind == SessionType::Chat {
                        inner.messages.push(Message::assistant(result.text.clone()));
                    }
                    let stats = &mut inner.stats;
                    stats.generations += 1;
                    stats.total_tokens_generated += result.tokens_generated as u64;
                    stats.total_prompt_tokens += result.prompt_tokens as u64;
                    stats.total_generation_time += result.duration;
                    SessionState::Idle
                }
                TaskCompletion::Failed(_) => {
                    inner.stats.failures += 1;
                    SessionState::Error
                }
                TaskCompletion::Cancelled => SessionState::Idle,
            };
            if current && inner.state == SessionState::Generating {
                inner.set_state(next)
            } else {
                None
            }
        };
        self.emit_change(change);

        let task_id = task_id.clone();
        match &completion {
            TaskCompletion::Completed(result) => {
                debug!(session_id = %self.id, task_id = %task_id, tokens = result.tokens_generated, "generation completed");
                self.emit(SessionEvent::Completed {
                    task_id,
                    result: result.clone(),
                });
            }
            TaskCompletion::Failed(error) => {
                warn!(session_id = %self.id, task_id = %task_id, error = %error, "generation failed");
                self.emit(SessionEvent::Failed {
                    task_id,
                    error: error.clone(),
                });
            }
            TaskCompletion::Cancelled => {
                debug!(session_id = %self.id, task_id = %task_id, "generation cancelled");
                self.emit(SessionEvent::Cancelled { task_id });
            }
        }
        if let Some(callback) = on_complete {
            callback(completion);
        }
    }

    // ── Embedding ───────────────────────────────────────────────────

    /// Compute an embedding for `text` on the engine.
    ///
    /// Does not occupy the generation slot, so it may run alongside a
    /// generation of the same session.
    pub fn generate_embedding<F>(
        self: &Arc<Self>,
        text: impl Into<String>,
        on_complete: F,
    ) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<Vec<f32>>) + Send + 'static,
    {
        let text = text.into();
        let engine = Arc::clone(&self.services.engine);
        let task = Task::new(TaskKind::Embedding, TaskPriority::Normal, move |_ctx| {
            engine.embedding(&text)
        })
        .with_description(format!("embedding for session {}", self.id));
        let task_id = task.id().clone();

        let session = Arc::clone(self);
        let finished_id = task_id.clone();
        let task = task.on_complete(move |completion| {
            let _ = session.inner.write().active_tasks.remove(&finished_id);
            on_complete(completion);
        });

        {
            let mut inner = self.inner.write();
            self.check_accepting(&inner)?;
            let _ = inner.active_tasks.insert(task_id.clone());
            inner.touch();
        }
        if self.services.processor.submit(task).is_none() {
            let _ = self.inner.write().active_tasks.remove(&task_id);
            return Err(KilnError::invalid_state("task processor is not accepting work"));
        }
        Ok(task_id)
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Cancel one of this session's tasks.
    ///
    /// Returns the session to `Idle` at once if it was generating. The task
    /// itself stops at its next token boundary. Returns `false` for tasks the
    /// session does not own.
    pub fn cancel_generation(&self, task_id: &TaskId) -> bool {
        let change = {
            let mut inner = self.inner.write();
            if !inner.active_tasks.remove(task_id) {
                return false;
            }
            if inner.generation.as_ref() == Some(task_id) {
                inner.release_generation()
            } else {
                None
            }
        };
        let _ = self.services.processor.cancel(task_id);
        self.emit_change(change);
        true
    }

    /// Cancel every task this session owns. Returns how many were owned.
    pub fn cancel_all_generations(&self) -> usize {
        let (tasks, change) = {
            let mut inner = self.inner.write();
            let tasks: Vec<TaskId> = inner.active_tasks.drain().collect();
            (tasks, inner.release_generation())
        };
        let _ = self.cancel_tasks(&tasks);
        self.emit_change(change);
        tasks.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::services;
    use assert_matches::assert_matches;
    use kiln_core::SessionId;
    use kiln_engine::StopReason;
    use kiln_engine::testing::ScriptedBackend;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session(kind: SessionType, backend: ScriptedBackend) -> Arc<Session> {
        Session::new(SessionId::new(), kind, GenerationConfig::default(), services(backend))
    }

    fn completion_channel() -> (
        GenerationHandlers,
        mpsc::UnboundedReceiver<TaskCompletion<GenerationResult>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = GenerationHandlers::completion(move |completion| {
            let _ = tx.send(completion);
        });
        (handlers, rx)
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[test]
    fn preamble_lists_tools() {
        let tools = vec![ToolSpec {
            name: "search".into(),
            description: "look things up".into(),
            parameters: json!({}),
        }];
        assert_eq!(
            system_preamble(Some("be brief"), &tools).unwrap(),
            "be brief\n\nAvailable tools:\n- search: look things up"
        );
        assert_eq!(
            system_preamble(None, &tools).unwrap(),
            "Available tools:\n- search: look things up"
        );
        assert_eq!(system_preamble(Some("x"), &[]).as_deref(), Some("x"));
        assert_eq!(system_preamble(None, &[]), None);
    }

    #[test]
    fn raw_prompt_joins_contents() {
        let messages = [Message::system("s"), Message::user("u")];
        assert_eq!(raw_prompt(&messages), "s\nu");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chat_generation_appends_reply_and_totals() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["Hi", " there"]));
        session.set_system_prompt(Some("be kind".into()));
        let (handlers, mut rx) = completion_channel();
        let (token_tx, mut token_rx) = mpsc::unbounded_channel();
        let handlers = handlers.on_token(move |piece| {
            let _ = token_tx.send(piece.to_owned());
        });

        let id = session.generate_completion_for_prompt("hello", handlers).unwrap();
        assert!(session.active_tasks().contains(&id));

        let result = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(result.text, "Hi there");
        assert_eq!(result.task_id, id);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
        assert_eq!(recv(&mut token_rx).await, "Hi");
        assert_eq!(recv(&mut token_rx).await, " there");

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            session.conversation_history(),
            [Message::user("hello"), Message::assistant("Hi there")]
        );
        let stats = session.stats();
        assert_eq!(stats.generations, 1);
        assert_eq!(stats.total_tokens_generated, 2);
        assert!(session.active_tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prompt_carries_system_prompt_in_chat_format() {
        let backend = ScriptedBackend::new(["ok"]);
        let script_log = backend.script_log();
        let session = session(SessionType::Chat, backend);
        session.set_system_prompt(Some("be kind".into()));
        let (handlers, mut rx) = completion_channel();
        let _ = session.generate_completion_for_prompt("hello", handlers).unwrap();
        let _ = recv(&mut rx).await;
        let prompt = script_log.prompts().pop().unwrap();
        assert!(prompt.starts_with("<|im_start|>system\nbe kind<|im_end|>"));
        assert!(prompt.contains("<|im_start|>user\nhello<|im_end|>"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_session_keeps_history_and_uses_raw_prompt() {
        let backend = ScriptedBackend::new(["world"]);
        let script_log = backend.script_log();
        let session = session(SessionType::Completion, backend);
        let (handlers, mut rx) = completion_channel();
        let _ = session.generate_completion_for_prompt("hello", handlers).unwrap();
        let result = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(result.text, "world");
        assert_eq!(session.conversation_history(), [Message::user("hello")]);
        assert_eq!(script_log.prompts(), ["hello"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_generation_is_rejected_while_generating() {
        let backend = ScriptedBackend::new(["a", "b", "c"]).with_token_delay(Duration::from_millis(30));
        let script_log = backend.script_log();
        let session = session(SessionType::Chat, backend);
        let (handlers, mut rx) = completion_channel();
        let _ = session.generate_response(handlers).unwrap();
        assert_eq!(session.state(), SessionState::Generating);

        let (second, mut second_rx) = completion_channel();
        let err = session.generate_response(second).unwrap_err();
        assert_matches!(err, KilnError::InvalidState(_));

        let _ = recv(&mut rx).await;
        assert_eq!(script_log.completions(), 1);
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_prompt_is_not_appended() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["a"]));
        session.pause();
        let err = session
            .generate_completion_for_prompt("hi", GenerationHandlers::new())
            .unwrap_err();
        assert_matches!(err, KilnError::InvalidState(msg) if msg.contains("paused"));
        assert_eq!(session.message_count(), 0);

        session.stop();
        assert_matches!(
            session.generate_response(GenerationHandlers::new()),
            Err(KilnError::InvalidState(msg)) if msg.contains("stopped")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unloaded_engine_rejects_synchronously() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["a"]));
        session.services.engine.unload_model();
        assert_matches!(
            session.generate_response(GenerationHandlers::new()),
            Err(KilnError::ModelNotLoaded)
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_failure_moves_to_error_without_history_change() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["a", "b"]).failing_at(1));
        session.add_message(Message::user("hi"));
        let (handlers, mut rx) = completion_channel();
        let _ = session.generate_response(handlers).unwrap();
        let completion = recv(&mut rx).await;
        assert_matches!(completion, TaskCompletion::Failed(KilnError::GenerationFailed(_)));
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.stats().failures, 1);

        let (handlers, mut rx) = completion_channel();
        assert!(session.generate_response(handlers).is_ok());
        let _ = recv(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_returns_to_idle_and_delivers_cancelled() {
        let backend = ScriptedBackend::new(vec!["x"; 200]).with_token_delay(Duration::from_millis(5));
        let session = session(SessionType::Chat, backend);
        let mut events = session.subscribe();
        let (handlers, mut rx) = completion_channel();
        let id = session.generate_response(handlers).unwrap();

        assert!(session.cancel_generation(&id));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.cancel_generation(&id));

        assert!(recv(&mut rx).await.is_cancelled());
        assert_eq!(session.message_count(), 0);

        let mut saw_cancelled = false;
        while let Ok(event) = events.try_recv() {
            if event == (SessionEvent::Cancelled { task_id: id.clone() }) {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reply_finishing_before_reset_is_discarded() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["late reply"]));
        let (handlers, mut rx) = completion_channel();
        // Hold the delivery dispatcher so the finished body's completion
        // is still queued when the session is reset.
        let handlers = handlers.on_token(|_| std::thread::sleep(Duration::from_millis(300)));
        let _ = session
            .generate_completion_for_prompt("hello", handlers)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        let _ = recv(&mut rx).await;

        assert!(session.conversation_history().is_empty());
        assert_eq!(session.stats().generations, 0);
        assert_eq!(session.stats().total_tokens_generated, 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_covers_embeddings() {
        let backend = ScriptedBackend::new(vec!["x"; 200]).with_token_delay(Duration::from_millis(5));
        let session = session(SessionType::Chat, backend);
        let (handlers, mut rx) = completion_channel();
        let _ = session.generate_response(handlers).unwrap();
        let (tx, mut embed_rx) = mpsc::unbounded_channel();
        let _ = session
            .generate_embedding("text", move |c| {
                let _ = tx.send(c);
            })
            .unwrap();
        assert_eq!(session.cancel_all_generations(), 2);
        assert!(recv(&mut rx).await.is_cancelled());
        let _ = recv(&mut embed_rx).await;
        assert!(session.active_tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn embedding_result_is_delivered() {
        let session = session(SessionType::Embedding, ScriptedBackend::new(Vec::<String>::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = session
            .generate_embedding("hello", move |c| {
                let _ = tx.send(c);
            })
            .unwrap();
        let vector = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(vector.len(), 8);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multimodal_requires_projector() {
        let session = session(SessionType::Multimodal, ScriptedBackend::new(["a cat"]));
        assert_matches!(
            session.generate_multimodal("describe", vec!["/tmp/cat.png".into()], GenerationHandlers::new()),
            Err(KilnError::MultimodalNotEnabled)
        );
        assert_eq!(session.message_count(), 0);

        session.services.engine.init_multimodal("/models/mmproj.gguf", false).unwrap();
        let (handlers, mut rx) = completion_channel();
        let _ = session
            .generate_multimodal("describe", vec!["/tmp/cat.png".into()], handlers)
            .unwrap();
        let result = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(result.text, "a cat");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_follows_max_tokens() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["a", "b", "c", "d"]));
        session.set_generation_config(GenerationConfig::default().with_max_tokens(2));
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (handlers, mut rx) = completion_channel();
        let handlers = handlers.on_progress(move |p| {
            let _ = progress_tx.send(p);
        });
        let _ = session.generate_response(handlers).unwrap();
        let result = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(result.tokens_generated, 2);
        assert_eq!(result.stop_reason, StopReason::MaxTokens);

        let mut seen = Vec::new();
        while let Ok(p) = progress_rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, [0.5, 1.0, 1.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_processor_rolls_back() {
        let session = session(SessionType::Chat, ScriptedBackend::new(["a"]));
        session.services.processor.stop();
        assert_matches!(
            session.generate_response(GenerationHandlers::new()),
            Err(KilnError::InvalidState(msg)) if msg.contains("not accepting")
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_generating());
        assert!(session.active_tasks().is_empty());
    }
}
