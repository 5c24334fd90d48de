//! One runtime instance: a processor, an engine, a context manager, the
//! session registry and the model manager, all wired to each other.

use std::sync::Arc;

use kiln_context::ContextManager;
use kiln_engine::{EngineHandle, InferenceBackend};
use kiln_settings::KilnSettings;
use kiln_tasks::TaskProcessor;
use tokio::runtime::Handle;
use tracing::info;

use crate::model::ModelManager;
use crate::registry::SessionRegistry;
use crate::session::Services;

/// Shared services for one engine.
///
/// Nothing here is global; tests and embedders build as many isolated
/// runtimes as they need.
pub struct KilnRuntime {
    settings: KilnSettings,
    processor: Arc<TaskProcessor>,
    engine: Arc<EngineHandle>,
    context: Arc<ContextManager>,
    sessions: SessionRegistry,
    models: Arc<ModelManager>,
}

impl KilnRuntime {
    /// Build a runtime on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime.
    pub fn new(settings: KilnSettings, backend: Box<dyn InferenceBackend>) -> Self {
        Self::with_runtime(settings, backend, Handle::current())
    }

    /// Build a runtime whose workers run on `runtime`.
    pub fn with_runtime(
        settings: KilnSettings,
        backend: Box<dyn InferenceBackend>,
        runtime: Handle,
    ) -> Self {
        let processor = Arc::new(TaskProcessor::with_runtime(
            settings.processor.max_concurrent_tasks,
            runtime,
        ));
        let engine = Arc::new(EngineHandle::new(backend));
        let context = Arc::new(ContextManager::new(settings.context.clone()));
        let services = Services {
            processor: Arc::clone(&processor),
            engine: Arc::clone(&engine),
            context: Arc::clone(&context),
        };
        let sessions = SessionRegistry::new(
            services,
            settings.sessions.max_concurrent_sessions,
            settings.generation.clone(),
        );
        let models = Arc::new(ModelManager::new(
            Arc::clone(&processor),
            Arc::clone(&engine),
            settings.model.clone(),
        ));
        info!(
            max_tasks = settings.processor.max_concurrent_tasks,
            max_sessions = settings.sessions.max_concurrent_sessions,
            "runtime ready"
        );
        Self {
            settings,
            processor,
            engine,
            context,
            sessions,
            models,
        }
    }

    /// Settings the runtime was built with.
    pub fn settings(&self) -> &KilnSettings {
        &self.settings
    }

    /// The task processor every session and the model manager submit to.
    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    /// The engine wrapper.
    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    /// Global context defaults and counters.
    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Model lifecycle.
    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    /// Destroy every session, stop accepting work and wait for running
    /// tasks to finish.
    pub async fn shutdown(&self) {
        let destroyed = self.sessions.destroy_all();
        self.processor.stop();
        self.processor.wait_idle().await;
        info!(destroyed, "runtime shut down");
    }
}

impl std::fmt::Debug for KilnRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnRuntime")
            .field("sessions", &self.sessions.len())
            .field("model", &self.models.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
