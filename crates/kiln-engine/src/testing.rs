//! Deterministic in-process backend for tests.
//!
//! [`ScriptedBackend`] replays a fixed list of text pieces for every
//! completion and records what the runtime asked of it in a shared
//! [`ScriptLog`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use kiln_core::KilnError;
use kiln_settings::{GenerationConfig, LoraAdapter, ModelConfig};
use parking_lot::Mutex;

use crate::backend::{InferenceBackend, ModelInfo, Token, TokenOutput, TokenizeResult};
use crate::bench::BenchParams;

/// Observations shared between a [`ScriptedBackend`] and the test.
#[derive(Debug, Default)]
pub struct ScriptLog {
    completions: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    last_config: Mutex<Option<GenerationConfig>>,
}

impl ScriptLog {
    /// Completions begun.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Completions begun and not yet ended.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active completions seen.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Every prompt loaded, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Sampling config of the most recent completion.
    pub fn last_config(&self) -> Option<GenerationConfig> {
        self.last_config.lock().clone()
    }
}

/// Backend that replays `script` for every completion.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Vec<String>,
    token_delay: Duration,
    fail_load: bool,
    fail_at: Option<usize>,
    cursor: usize,
    loaded: bool,
    multimodal: bool,
    lora: Vec<LoraAdapter>,
    script_log: Arc<ScriptLog>,
}

impl ScriptedBackend {
    /// Replay `pieces`, one per sampled token.
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: pieces.into_iter().map(Into::into).collect(),
            token_delay: Duration::ZERO,
            fail_load: false,
            fail_at: None,
            cursor: 0,
            loaded: false,
            multimodal: false,
            lora: Vec::new(),
            script_log: Arc::new(ScriptLog::default()),
        }
    }

    /// Sleep this long inside every token step.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Reject every model load.
    #[must_use]
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Fail the token step at `index` (zero-based).
    #[must_use]
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Shared observation handle.
    pub fn script_log(&self) -> Arc<ScriptLog> {
        Arc::clone(&self.script_log)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load_model(&mut self, _config: &ModelConfig) -> bool {
        self.loaded = !self.fail_load;
        self.loaded
    }

    fn unload_model(&mut self) {
        self.loaded = false;
        self.multimodal = false;
        self.lora.clear();
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.loaded.then(|| ModelInfo {
            description: "scripted".into(),
            size_bytes: 1024,
            n_params: 1_000_000,
            n_ctx_train: 4096,
            chat_template: None,
        })
    }

    fn tokenize(&mut self, text: &str, media_paths: &[String]) -> kiln_core::Result<TokenizeResult> {
        if !media_paths.is_empty() && !self.multimodal {
            return Err(KilnError::MultimodalNotEnabled);
        }
        let tokens = (0..text.split_whitespace().count())
            .map(|i| Token::try_from(i).unwrap_or(Token::MAX))
            .collect();
        Ok(TokenizeResult {
            tokens,
            has_media: !media_paths.is_empty(),
        })
    }

    fn detokenize(&mut self, tokens: &[Token]) -> kiln_core::Result<String> {
        Ok(tokens
            .iter()
            .map(|t| format!("<{t}>"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> i32 {
        if adapters.iter().any(|a| a.path.is_empty()) {
            return -1;
        }
        self.lora.extend_from_slice(adapters);
        0
    }

    fn remove_lora_adapters(&mut self) {
        self.lora.clear();
    }

    fn loaded_lora_adapters(&self) -> Vec<LoraAdapter> {
        self.lora.clone()
    }

    fn init_multimodal(&mut self, mmproj_path: &str, _use_gpu: bool) -> bool {
        self.multimodal = !mmproj_path.is_empty();
        self.multimodal
    }

    fn release_multimodal(&mut self) {
        self.multimodal = false;
    }

    fn is_multimodal_enabled(&self) -> bool {
        self.multimodal
    }

    fn supports_vision(&self) -> bool {
        self.multimodal
    }

    fn supports_audio(&self) -> bool {
        false
    }

    fn set_sampling(&mut self, config: &GenerationConfig) {
        *self.script_log.last_config.lock() = Some(config.clone());
    }

    fn init_sampling(&mut self) -> bool {
        true
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn load_prompt(&mut self, prompt: &str, media_paths: &[String]) -> kiln_core::Result<usize> {
        let tokens = self.tokenize(prompt, media_paths)?.tokens.len();
        self.script_log.prompts.lock().push(prompt.to_owned());
        Ok(tokens)
    }

    fn begin_completion(&mut self) {
        let _ = self.script_log.completions.fetch_add(1, Ordering::SeqCst);
        let now = self.script_log.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.script_log.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn has_next_token(&self) -> bool {
        self.cursor < self.script.len()
    }

    fn do_completion(&mut self) -> kiln_core::Result<TokenOutput> {
        if !self.token_delay.is_zero() {
            thread::sleep(self.token_delay);
        }
        let index = self.cursor;
        self.cursor += 1;
        if self.fail_at == Some(index) {
            return Err(KilnError::GenerationFailed(format!(
                "scripted failure at token {index}"
            )));
        }
        Ok(TokenOutput {
            token: Token::try_from(index).unwrap_or(Token::MAX),
            text: self.script.get(index).cloned().unwrap_or_default(),
        })
    }

    fn end_completion(&mut self) {
        let _ = self.script_log.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn embedding(&mut self, text: &str) -> kiln_core::Result<Vec<f32>> {
        let mut vector = [0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % vector.len()] += f32::from(byte);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector.to_vec())
    }

    fn bench(&mut self, params: &BenchParams) -> String {
        serde_json::json!([
            "scripted",
            1024,
            1_000_000,
            f64::from(params.prompt_tokens) * 2.0,
            0.5,
            f64::from(params.gen_tokens) / 2.0,
            0.25
        ])
        .to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
