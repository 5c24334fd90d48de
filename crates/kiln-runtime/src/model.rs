//! Model lifecycle on top of the shared engine.
//!
//! Loading, unloading, tokenization and benchmarking run as tasks on the
//! processor so callers never wait on the engine lock. Adapter and projector
//! changes are short and run on the caller's thread; they block only until
//! the engine is free and never while a manager lock is held.

use std::path::Path;
use std::sync::Arc;

use kiln_core::{EventEmitter, KilnError, TaskId};
use kiln_engine::{BenchParams, BenchmarkReport, EngineHandle, ModelInfo, Token, TokenizeResult};
use kiln_settings::{LoraAdapter, ModelConfig, MultimodalConfig};
use kiln_tasks::{Task, TaskCompletion, TaskKind, TaskPriority, TaskProcessor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

/// Where the model is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelState {
    /// No weights in the engine.
    #[default]
    Unloaded,
    /// A load task is pending or running.
    Loading,
    /// Weights are loaded.
    Loaded,
    /// The last load failed.
    Error,
}

/// Observer notification from the model manager.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Previous state.
        from: ModelState,
        /// New state.
        to: ModelState,
    },
    /// Load progress in `[0, 1]`.
    Progress {
        /// Fraction done.
        progress: f32,
    },
    /// A model finished loading.
    Loaded {
        /// Engine description, when available.
        info: Option<ModelInfo>,
    },
    /// A load failed.
    LoadFailed {
        /// Why.
        error: KilnError,
    },
    /// The model was released.
    Unloaded,
}

struct ModelInner {
    state: ModelState,
    config: Option<ModelConfig>,
    multimodal: Option<MultimodalConfig>,
    info: Option<ModelInfo>,
    last_error: Option<KilnError>,
}

impl ModelInner {
    fn set_state(&mut self, to: ModelState) -> Option<(ModelState, ModelState)> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some((from, to))
    }
}

/// Loads, unloads and inspects the model behind the shared engine.
pub struct ModelManager {
    processor: Arc<TaskProcessor>,
    engine: Arc<EngineHandle>,
    inner: Mutex<ModelInner>,
    events: EventEmitter<ModelEvent>,
}

impl ModelManager {
    pub(crate) fn new(
        processor: Arc<TaskProcessor>,
        engine: Arc<EngineHandle>,
        config: Option<ModelConfig>,
    ) -> Self {
        Self {
            processor,
            engine,
            inner: Mutex::new(ModelInner {
                state: ModelState::Unloaded,
                config,
                multimodal: None,
                info: None,
                last_error: None,
            }),
            events: EventEmitter::new(),
        }
    }

    // ── State ───────────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        self.inner.lock().state
    }

    /// Whether a model is loaded.
    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    /// Whether a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.state() == ModelState::Loading
    }

    /// Configuration of the current or most recent load.
    pub fn current_config(&self) -> Option<ModelConfig> {
        self.inner.lock().config.clone()
    }

    /// Error of the last failed load.
    pub fn last_error(&self) -> Option<KilnError> {
        self.inner.lock().last_error.clone()
    }

    /// Engine description of the loaded model.
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.inner.lock().info.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ModelEvent) {
        let _ = self.events.emit(event);
    }

    fn emit_change(&self, change: Option<(ModelState, ModelState)>) {
        if let Some((from, to)) = change {
            debug!(?from, ?to, "model state changed");
            self.emit(ModelEvent::StateChanged { from, to });
        }
    }

    fn require_loaded(&self) -> kiln_core::Result<()> {
        if self.engine.is_loaded() {
            Ok(())
        } else {
            Err(KilnError::ModelNotLoaded)
        }
    }

    fn submit<T: Send + 'static>(&self, task: Task<T>) -> kiln_core::Result<TaskId> {
        self.processor
            .submit(task)
            .ok_or_else(|| KilnError::invalid_state("task processor is not accepting work"))
    }

    // ── Load / unload ───────────────────────────────────────────────

    /// Check a configuration without loading it.
    pub fn validate_configuration(config: &ModelConfig) -> kiln_core::Result<()> {
        config.validate()
    }

    /// Load `config` as a critical-priority task.
    ///
    /// The configuration is validated synchronously; a rejected call never
    /// invokes `on_complete`.
    pub fn load<F>(self: &Arc<Self>, config: ModelConfig, on_complete: F) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<()>) + Send + 'static,
    {
        self.load_with_progress(config, |_| {}, on_complete)
    }

    /// [`load`](Self::load) with a progress callback.
    #[instrument(skip_all, fields(path = %config.model_path))]
    pub fn load_with_progress<P, F>(
        self: &Arc<Self>,
        config: ModelConfig,
        mut on_progress: P,
        on_complete: F,
    ) -> kiln_core::Result<TaskId>
    where
        P: FnMut(f32) + Send + 'static,
        F: FnOnce(TaskCompletion<()>) + Send + 'static,
    {
        config.validate()?;

        let engine = Arc::clone(&self.engine);
        let load_config = config.clone();
        let task = Task::new(TaskKind::ModelLoad, TaskPriority::Critical, move |ctx| {
            ctx.report_progress(0.1);
            engine.load_model(&load_config)?;
            ctx.report_progress(1.0);
            Ok(())
        })
        .with_description(format!("load {}", config.model_path));

        let manager = Arc::clone(self);
        let task = task.on_progress(move |progress| {
            manager.emit(ModelEvent::Progress { progress });
            on_progress(progress);
        });
        let manager = Arc::clone(self);
        let task = task.on_complete(move |completion| {
            manager.finish_load(&completion);
            on_complete(completion);
        });

        let change = {
            let mut inner = self.inner.lock();
            if inner.state == ModelState::Loading {
                return Err(KilnError::invalid_state("model load already in progress"));
            }
            inner.config = Some(config);
            inner.last_error = None;
            inner.multimodal = None;
            inner.set_state(ModelState::Loading)
        };
        self.emit_change(change);

        match self.submit(task) {
            Ok(id) => Ok(id),
            Err(err) => {
                let change = self.inner.lock().set_state(ModelState::Unloaded);
                self.emit_change(change);
                Err(err)
            }
        }
    }

    fn finish_load(&self, completion: &TaskCompletion<()>) {
        let info = self.engine.model_info();
        let (change, event) = {
            let mut inner = self.inner.lock();
            inner.info.clone_from(&info);
            match completion {
                TaskCompletion::Completed(()) => (
                    inner.set_state(ModelState::Loaded),
                    Some(ModelEvent::Loaded { info }),
                ),
                TaskCompletion::Failed(error) => {
                    inner.last_error = Some(error.clone());
                    (
                        inner.set_state(ModelState::Error),
                        Some(ModelEvent::LoadFailed {
                            error: error.clone(),
                        }),
                    )
                }
                TaskCompletion::Cancelled => {
                    let to = if self.engine.is_loaded() {
                        ModelState::Loaded
                    } else {
                        ModelState::Unloaded
                    };
                    (inner.set_state(to), None)
                }
            }
        };
        match &event {
            Some(ModelEvent::Loaded { .. }) => info!("model ready"),
            Some(ModelEvent::LoadFailed { error }) => error!(error = %error, "model load failed"),
            _ => debug!("model load cancelled"),
        }
        self.emit_change(change);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Release the model, its adapters and its projector.
    pub fn unload<F>(self: &Arc<Self>, on_complete: F) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<()>) + Send + 'static,
    {
        if self.is_loading() {
            return Err(KilnError::invalid_state("cannot unload while a load is in progress"));
        }
        let engine = Arc::clone(&self.engine);
        let manager = Arc::clone(self);
        let task = Task::new(TaskKind::ModelLoad, TaskPriority::Critical, move |_ctx| {
            engine.unload_model();
            Ok(())
        })
        .with_description("unload model")
        .on_complete(move |completion| {
            if !manager.engine.is_loaded() {
                let change = {
                    let mut inner = manager.inner.lock();
                    inner.info = None;
                    inner.multimodal = None;
                    inner.set_state(ModelState::Unloaded)
                };
                manager.emit_change(change);
                manager.emit(ModelEvent::Unloaded);
            }
            on_complete(completion);
        });
        self.submit(task)
    }

    /// Load the most recent configuration again.
    pub fn reload<F>(self: &Arc<Self>, on_complete: F) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<()>) + Send + 'static,
    {
        let config = self
            .current_config()
            .ok_or_else(|| KilnError::invalid_state("no model configuration to reload"))?;
        self.load(config, on_complete)
    }

    // ── LoRA ────────────────────────────────────────────────────────

    /// Apply adapters on top of the loaded model.
    pub fn apply_lora(&self, adapters: &[LoraAdapter]) -> kiln_core::Result<()> {
        self.require_loaded()?;
        for adapter in adapters {
            if adapter.path.trim().is_empty() {
                return Err(KilnError::invalid_argument("adapter path is required"));
            }
            if !Path::new(&adapter.path).is_file() {
                return Err(KilnError::FileNotFound(adapter.path.clone()));
            }
        }
        self.engine.apply_lora(adapters)
    }

    /// Remove every adapter.
    pub fn remove_lora(&self) -> kiln_core::Result<()> {
        self.engine.remove_lora()
    }

    /// Adapters currently applied.
    pub fn loaded_lora(&self) -> Vec<LoraAdapter> {
        self.engine.loaded_lora()
    }

    // ── Multimodal ──────────────────────────────────────────────────

    /// Load a multimodal projector for the current model.
    pub fn init_multimodal(&self, config: &MultimodalConfig) -> kiln_core::Result<()> {
        self.require_loaded()?;
        config.validate()?;
        self.engine.init_multimodal(&config.mmproj_path, config.use_gpu)?;
        self.inner.lock().multimodal = Some(config.clone());
        Ok(())
    }

    /// Release the projector.
    pub fn release_multimodal(&self) {
        self.engine.release_multimodal();
        self.inner.lock().multimodal = None;
    }

    /// A projector is loaded.
    pub fn is_multimodal_enabled(&self) -> bool {
        self.engine.is_multimodal_enabled()
    }

    /// Images are accepted by both the projector and its configuration.
    pub fn supports_vision(&self) -> bool {
        let enabled = self
            .inner
            .lock()
            .multimodal
            .as_ref()
            .is_some_and(|c| c.enable_vision);
        enabled && self.engine.supports_vision()
    }

    /// Audio is accepted by both the projector and its configuration.
    pub fn supports_audio(&self) -> bool {
        let enabled = self
            .inner
            .lock()
            .multimodal
            .as_ref()
            .is_some_and(|c| c.enable_audio);
        enabled && self.engine.supports_audio()
    }

    // ── Tokens ──────────────────────────────────────────────────────

    /// Tokenize on a worker.
    pub fn tokenize<F>(
        &self,
        text: impl Into<String>,
        media_paths: Vec<String>,
        on_complete: F,
    ) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<TokenizeResult>) + Send + 'static,
    {
        self.require_loaded()?;
        let text = text.into();
        let engine = Arc::clone(&self.engine);
        let task = Task::new(TaskKind::Tokenization, TaskPriority::Normal, move |_ctx| {
            engine
                .tokenize(&text, &media_paths)
                .map_err(|e| match e {
                    KilnError::ModelNotLoaded | KilnError::MultimodalNotEnabled => e,
                    other => KilnError::TokenizationFailed(other.to_string()),
                })
        })
        .on_complete(on_complete);
        self.submit(task)
    }

    /// Detokenize on a worker.
    pub fn detokenize<F>(&self, tokens: Vec<Token>, on_complete: F) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<String>) + Send + 'static,
    {
        self.require_loaded()?;
        let engine = Arc::clone(&self.engine);
        let task = Task::new(TaskKind::Tokenization, TaskPriority::Normal, move |_ctx| {
            engine.detokenize(&tokens).map_err(|e| match e {
                KilnError::ModelNotLoaded => e,
                other => KilnError::DetokenizationFailed(other.to_string()),
            })
        })
        .on_complete(on_complete);
        self.submit(task)
    }

    /// Exact token count, on the caller's thread.
    pub fn count_tokens(&self, text: &str) -> kiln_core::Result<usize> {
        self.engine.count_tokens(text)
    }

    // ── Benchmark ───────────────────────────────────────────────────

    /// Benchmark the loaded model as a low-priority task.
    pub fn bench<F>(&self, params: BenchParams, on_complete: F) -> kiln_core::Result<TaskId>
    where
        F: FnOnce(TaskCompletion<BenchmarkReport>) + Send + 'static,
    {
        self.require_loaded()?;
        let engine = Arc::clone(&self.engine);
        let task = Task::new(TaskKind::Benchmark, TaskPriority::Low, move |_ctx| {
            engine.bench(params)
        })
        .with_description("benchmark")
        .on_complete(on_complete);
        self.submit(task)
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kiln_engine::testing::ScriptedBackend;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn manager(backend: ScriptedBackend) -> Arc<ModelManager> {
        Arc::new(ModelManager::new(
            Arc::new(TaskProcessor::new(2)),
            Arc::new(EngineHandle::new(Box::new(backend))),
            None,
        ))
    }

    fn weights() -> NamedTempFile {
        NamedTempFile::new().unwrap()
    }

    fn config(file: &NamedTempFile) -> ModelConfig {
        ModelConfig::with_model_path(file.path().to_string_lossy())
    }

    fn channel<T: Send + 'static>() -> (
        impl FnOnce(TaskCompletion<T>) + Send + 'static,
        mpsc::UnboundedReceiver<TaskCompletion<T>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |c| {
                let _ = tx.send(c);
            },
            rx,
        )
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn load(manager: &Arc<ModelManager>, file: &NamedTempFile) {
        let (done, mut rx) = channel();
        let _ = manager.load(config(file), done).unwrap();
        recv(&mut rx).await.into_result().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_moves_through_states() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        let mut events = manager.subscribe();
        load(&manager, &file).await;

        assert_eq!(manager.state(), ModelState::Loaded);
        assert_eq!(manager.model_info().unwrap().description, "scripted");
        assert_eq!(
            events.recv().await.unwrap(),
            ModelEvent::StateChanged {
                from: ModelState::Unloaded,
                to: ModelState::Loading
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_config_is_rejected_synchronously() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let (done, _rx) = channel();
        assert_matches!(
            manager.load(ModelConfig::with_model_path("/definitely/missing.gguf"), done),
            Err(KilnError::FileNotFound(_))
        );
        assert_eq!(manager.state(), ModelState::Unloaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_rejection_sets_error() {
        let manager = manager(ScriptedBackend::new(["a"]).failing_load());
        let file = weights();
        let (done, mut rx) = channel();
        let _ = manager.load(config(&file), done).unwrap();
        assert_matches!(
            recv(&mut rx).await,
            TaskCompletion::Failed(KilnError::ModelLoadFailed(_))
        );
        assert_eq!(manager.state(), ModelState::Error);
        assert_matches!(manager.last_error(), Some(KilnError::ModelLoadFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_needs_prior_config() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let (done, _rx) = channel();
        assert_matches!(manager.reload(done), Err(KilnError::InvalidState(_)));

        let file = weights();
        load(&manager, &file).await;
        let (done, mut rx) = channel();
        let _ = manager.reload(done).unwrap();
        recv(&mut rx).await.into_result().unwrap();
        assert!(manager.is_loaded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unload_releases_everything() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        load(&manager, &file).await;
        let (done, mut rx) = channel();
        let _ = manager.unload(done).unwrap();
        recv(&mut rx).await.into_result().unwrap();
        assert_eq!(manager.state(), ModelState::Unloaded);
        assert!(manager.model_info().is_none());
        assert_matches!(manager.count_tokens("a b"), Err(KilnError::ModelNotLoaded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lora_paths_are_checked() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        assert_matches!(
            manager.apply_lora(&[LoraAdapter::new("x")]),
            Err(KilnError::ModelNotLoaded)
        );
        load(&manager, &file).await;

        assert_matches!(
            manager.apply_lora(&[LoraAdapter::new("/missing/adapter.gguf")]),
            Err(KilnError::FileNotFound(_))
        );
        let adapter = weights();
        let path = adapter.path().to_string_lossy().into_owned();
        manager.apply_lora(&[LoraAdapter::with_scale(path, 0.5)]).unwrap();
        assert_eq!(manager.loaded_lora().len(), 1);
        manager.remove_lora().unwrap();
        assert!(manager.loaded_lora().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multimodal_capabilities_follow_config() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        load(&manager, &file).await;
        let projector = weights();
        let config = MultimodalConfig::audio_only(projector.path().to_string_lossy());
        manager.init_multimodal(&config).unwrap();
        assert!(manager.is_multimodal_enabled());
        assert!(!manager.supports_vision());
        assert!(!manager.supports_audio());

        manager.release_multimodal();
        assert!(!manager.is_multimodal_enabled());

        let vision = MultimodalConfig::vision_only(projector.path().to_string_lossy());
        manager.init_multimodal(&vision).unwrap();
        assert!(manager.supports_vision());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokenize_detokenize_and_count() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        load(&manager, &file).await;

        let (done, mut rx) = channel();
        let _ = manager.tokenize("one two three", Vec::new(), done).unwrap();
        let result = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(result.tokens, [0, 1, 2]);
        assert!(!result.has_media);

        let (done, mut rx) = channel();
        let _ = manager.detokenize(vec![4, 5], done).unwrap();
        assert_eq!(recv(&mut rx).await.into_result().unwrap(), "<4> <5>");

        assert_eq!(manager.count_tokens("a b c d").unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tasks_need_a_loaded_model() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let (done, _rx) = channel();
        assert_matches!(
            manager.tokenize("x", Vec::new(), done),
            Err(KilnError::ModelNotLoaded)
        );
        let (done, _rx) = channel();
        assert_matches!(
            manager.bench(BenchParams::default(), done),
            Err(KilnError::ModelNotLoaded)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bench_report_is_parsed() {
        let manager = manager(ScriptedBackend::new(["a"]));
        let file = weights();
        load(&manager, &file).await;
        let (done, mut rx) = channel();
        let params = BenchParams {
            prompt_tokens: 64,
            gen_tokens: 32,
            parallel: 1,
            repetitions: 1,
        };
        let _ = manager.bench(params, done).unwrap();
        let report = recv(&mut rx).await.into_result().unwrap();
        assert_eq!(report.params, params);
        assert!((report.generation_speed - 16.0).abs() < 1e-9);
    }
}
