//! The one shared engine instance.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_core::{KilnError, Message};
use kiln_settings::{LoraAdapter, ModelConfig};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{InferenceBackend, ModelInfo, Token, TokenizeResult};
use crate::bench::{BenchParams, BenchmarkReport};

/// Lock-owning wrapper around an [`InferenceBackend`].
///
/// Every method takes the engine mutex for its whole duration, so callers
/// cannot reach the backend without it. Multi-step work (a completion loop)
/// holds the lock across steps through an [`EngineLease`].
pub struct EngineHandle {
    backend: Mutex<Box<dyn InferenceBackend>>,
    loaded: AtomicBool,
    multimodal: AtomicBool,
    interrupted: AtomicBool,
}

impl EngineHandle {
    /// Wrap a backend. No model is loaded yet.
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
            loaded: AtomicBool::new(false),
            multimodal: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Whether a model is loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    // ── Model ───────────────────────────────────────────────────────

    /// Load weights, replacing any loaded model.
    pub fn load_model(&self, config: &ModelConfig) -> kiln_core::Result<()> {
        let mut backend = self.backend.lock();
        if self.loaded.swap(false, Ordering::AcqRel) {
            backend.unload_model();
            self.multimodal.store(false, Ordering::Release);
        }
        if !backend.load_model(config) {
            warn!(path = %config.model_path, "engine rejected model");
            return Err(KilnError::ModelLoadFailed(config.model_path.clone()));
        }
        self.loaded.store(true, Ordering::Release);
        info!(path = %config.model_path, "model loaded");
        Ok(())
    }

    /// Release the loaded model. No-op when nothing is loaded.
    pub fn unload_model(&self) {
        let mut backend = self.backend.lock();
        if self.loaded.swap(false, Ordering::AcqRel) {
            backend.unload_model();
            self.multimodal.store(false, Ordering::Release);
            info!("model unloaded");
        }
    }

    /// Description of the loaded model.
    pub fn model_info(&self) -> Option<ModelInfo> {
        let backend = self.backend.lock();
        if self.is_loaded() { backend.model_info() } else { None }
    }

    // ── Leasing ─────────────────────────────────────────────────────

    /// Take the engine for a multi-step interaction.
    ///
    /// Blocks until every other lease and call has finished.
    pub fn lease(&self) -> kiln_core::Result<EngineLease<'_>> {
        let guard = self.backend.lock();
        if !self.is_loaded() {
            return Err(KilnError::ModelNotLoaded);
        }
        Ok(EngineLease {
            guard,
            handle: self,
        })
    }

    /// Ask the current completion to stop at the next token boundary.
    ///
    /// Takes no lock. Cleared when the next completion begins.
    pub fn interrupt(&self) {
        debug!("engine interrupt requested");
        self.interrupted.store(true, Ordering::Release);
    }

    /// Whether an interrupt is pending.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    // ── Tokens ──────────────────────────────────────────────────────

    /// Tokenize `text`, with optional media.
    pub fn tokenize(&self, text: &str, media_paths: &[String]) -> kiln_core::Result<TokenizeResult> {
        self.lease()?.tokenize(text, media_paths)
    }

    /// Turn tokens back into text.
    pub fn detokenize(&self, tokens: &[Token]) -> kiln_core::Result<String> {
        self.lease()?.detokenize(tokens)
    }

    /// Exact token count of `text` under the loaded vocabulary.
    pub fn count_tokens(&self, text: &str) -> kiln_core::Result<usize> {
        Ok(self.tokenize(text, &[])?.tokens.len())
    }

    /// Render messages into a prompt with the engine's chat template.
    pub fn format_chat(&self, messages: &[Message], template: Option<&str>) -> String {
        self.backend.lock().format_chat(messages, template)
    }

    // ── LoRA ────────────────────────────────────────────────────────

    /// Apply adapters on top of the loaded model.
    pub fn apply_lora(&self, adapters: &[LoraAdapter]) -> kiln_core::Result<()> {
        let mut lease = self.lease()?;
        let status = lease.apply_lora_adapters(adapters);
        if status != 0 {
            return Err(KilnError::LoraApplicationFailed(format!(
                "engine returned status {status}"
            )));
        }
        debug!(count = adapters.len(), "lora adapters applied");
        Ok(())
    }

    /// Remove all adapters.
    pub fn remove_lora(&self) -> kiln_core::Result<()> {
        self.lease()?.remove_lora_adapters();
        Ok(())
    }

    /// Adapters currently applied. Empty when no model is loaded.
    pub fn loaded_lora(&self) -> Vec<LoraAdapter> {
        self.lease()
            .map(|lease| lease.loaded_lora_adapters())
            .unwrap_or_default()
    }

    // ── Multimodal ──────────────────────────────────────────────────

    /// Load a multimodal projector.
    pub fn init_multimodal(&self, mmproj_path: &str, use_gpu: bool) -> kiln_core::Result<()> {
        if !self.lease()?.init_multimodal(mmproj_path, use_gpu) {
            return Err(KilnError::MultimodalInitFailed(mmproj_path.to_owned()));
        }
        self.multimodal.store(true, Ordering::Release);
        info!(path = mmproj_path, use_gpu, "multimodal projector loaded");
        Ok(())
    }

    /// Release the projector, if any.
    pub fn release_multimodal(&self) {
        let mut backend = self.backend.lock();
        backend.release_multimodal();
        self.multimodal.store(false, Ordering::Release);
    }

    /// A projector is loaded. Takes no lock.
    pub fn is_multimodal_enabled(&self) -> bool {
        self.multimodal.load(Ordering::Acquire)
    }

    /// The projector accepts images.
    pub fn supports_vision(&self) -> bool {
        self.backend.lock().supports_vision()
    }

    /// The projector accepts audio.
    pub fn supports_audio(&self) -> bool {
        self.backend.lock().supports_audio()
    }

    // ── Other workloads ─────────────────────────────────────────────

    /// Embedding vector for `text`.
    pub fn embedding(&self, text: &str) -> kiln_core::Result<Vec<f32>> {
        self.lease()?.embedding(text)
    }

    /// Run the engine benchmark.
    pub fn bench(&self, params: BenchParams) -> kiln_core::Result<BenchmarkReport> {
        let raw = self.lease()?.bench(&params);
        BenchmarkReport::parse(&raw, params)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("loaded", &self.is_loaded())
            .field("multimodal", &self.is_multimodal_enabled())
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a loaded engine.
///
/// Dereferences to the backend. The engine lock is released on drop.
pub struct EngineLease<'a> {
    guard: MutexGuard<'a, Box<dyn InferenceBackend>>,
    pub(crate) handle: &'a EngineHandle,
}

impl Deref for EngineLease<'_> {
    type Target = dyn InferenceBackend;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl std::fmt::Debug for EngineLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DerefMut for EngineLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn loaded(backend: ScriptedBackend) -> EngineHandle {
        let engine = EngineHandle::new(Box::new(backend));
        engine
            .load_model(&ModelConfig::with_model_path("/models/test.gguf"))
            .unwrap();
        engine
    }

    #[test]
    fn calls_require_a_loaded_model() {
        let engine = EngineHandle::new(Box::new(ScriptedBackend::new(["a"])));
        assert!(!engine.is_loaded());
        assert_matches!(engine.tokenize("hi", &[]), Err(KilnError::ModelNotLoaded));
        assert_matches!(engine.embedding("hi"), Err(KilnError::ModelNotLoaded));
        assert_matches!(engine.lease(), Err(KilnError::ModelNotLoaded));
        assert!(engine.loaded_lora().is_empty());
        assert!(engine.model_info().is_none());
    }

    #[test]
    fn rejected_load_is_model_load_failed() {
        let engine = EngineHandle::new(Box::new(ScriptedBackend::new(["a"]).failing_load()));
        let err = engine
            .load_model(&ModelConfig::with_model_path("/models/bad.gguf"))
            .unwrap_err();
        assert_matches!(err, KilnError::ModelLoadFailed(path) if path == "/models/bad.gguf");
        assert!(!engine.is_loaded());
    }

    #[test]
    fn unload_clears_loaded_flag() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        assert!(engine.model_info().is_some());
        engine.unload_model();
        assert!(!engine.is_loaded());
        assert_matches!(engine.count_tokens("a b"), Err(KilnError::ModelNotLoaded));
    }

    #[test]
    fn count_tokens_goes_through_tokenizer() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        assert_eq!(engine.count_tokens("one two three").unwrap(), 3);
        assert_eq!(engine.detokenize(&[0, 1]).unwrap(), "<0> <1>");
    }

    #[test]
    fn lora_status_maps_to_error() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        engine.apply_lora(&[LoraAdapter::new("/loras/style.gguf")]).unwrap();
        assert_eq!(engine.loaded_lora().len(), 1);
        engine.remove_lora().unwrap();
        assert!(engine.loaded_lora().is_empty());

        let err = engine.apply_lora(&[LoraAdapter::new("")]).unwrap_err();
        assert_matches!(err, KilnError::LoraApplicationFailed(_));
    }

    #[test]
    fn multimodal_init_and_release() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        assert!(!engine.is_multimodal_enabled());
        engine.init_multimodal("/models/mmproj.gguf", true).unwrap();
        assert!(engine.is_multimodal_enabled());
        assert!(engine.supports_vision());
        engine.release_multimodal();
        assert!(!engine.is_multimodal_enabled());

        assert_matches!(
            engine.init_multimodal("", false),
            Err(KilnError::MultimodalInitFailed(_))
        );
    }

    #[test]
    fn bench_parses_report() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        let report = engine.bench(BenchParams::default()).unwrap();
        assert_eq!(report.model_description, "scripted");
        assert!(report.generation_speed > 0.0);
    }

    #[test]
    fn interrupt_flag_round_trip() {
        let engine = loaded(ScriptedBackend::new(["a"]));
        assert!(!engine.is_interrupted());
        engine.interrupt();
        assert!(engine.is_interrupted());
        engine.clear_interrupt();
        assert!(!engine.is_interrupted());
    }

    #[test]
    fn leases_are_exclusive() {
        let backend = ScriptedBackend::new(["a"]);
        let script_log = backend.script_log();
        let engine = Arc::new(loaded(backend));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let mut lease = engine.lease().unwrap();
                    lease.begin_completion();
                    thread::sleep(Duration::from_millis(10));
                    lease.end_completion();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(script_log.peak_active(), 1);
    }
}
