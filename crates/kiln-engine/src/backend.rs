//! The native engine surface the runtime drives.

use kiln_core::Message;
use kiln_settings::{GenerationConfig, LoraAdapter, ModelConfig};
use serde::{Deserialize, Serialize};

use crate::bench::BenchParams;
use crate::chat;

/// Engine vocabulary index.
pub type Token = i32;

/// One sampled token and its text piece.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenOutput {
    /// Sampled token.
    pub token: Token,
    /// Decoded text for this token. May be empty for partial UTF-8.
    pub text: String,
}

/// Result of tokenizing a prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizeResult {
    /// Token sequence.
    pub tokens: Vec<Token>,
    /// Whether media chunks were interleaved.
    pub has_media: bool,
}

/// Description of the loaded model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Human-readable model description.
    pub description: String,
    /// Weights size in bytes.
    pub size_bytes: u64,
    /// Parameter count.
    pub n_params: u64,
    /// Training context length.
    pub n_ctx_train: u32,
    /// Built-in chat template, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
}

/// A native inference backend.
///
/// Implementations are not expected to be thread-safe: the runtime only
/// reaches a backend through [`EngineHandle`](crate::EngineHandle), which
/// serialises every call behind one mutex.
pub trait InferenceBackend: Send {
    // ── Model ──────────────────────────────────────────────────────

    /// Load weights. Returns `false` when the engine rejects them.
    fn load_model(&mut self, config: &ModelConfig) -> bool;

    /// Release the loaded model.
    fn unload_model(&mut self) {}

    /// Description of the loaded model.
    fn model_info(&self) -> Option<ModelInfo> {
        None
    }

    // ── Tokens ─────────────────────────────────────────────────────

    /// Tokenize text, interleaving media chunks when paths are given.
    ///
    /// # Errors
    ///
    /// Backend-specific tokenization failures.
    fn tokenize(&mut self, text: &str, media_paths: &[String]) -> kiln_core::Result<TokenizeResult>;

    /// Turn tokens back into text.
    ///
    /// # Errors
    ///
    /// Backend-specific detokenization failures.
    fn detokenize(&mut self, tokens: &[Token]) -> kiln_core::Result<String>;

    // ── LoRA ───────────────────────────────────────────────────────

    /// Apply adapters. Returns the engine status code, zero on success.
    fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> i32;

    /// Remove all adapters.
    fn remove_lora_adapters(&mut self);

    /// Adapters currently applied.
    fn loaded_lora_adapters(&self) -> Vec<LoraAdapter>;

    // ── Multimodal ─────────────────────────────────────────────────

    /// Load a multimodal projector.
    fn init_multimodal(&mut self, mmproj_path: &str, use_gpu: bool) -> bool;

    /// Release the projector.
    fn release_multimodal(&mut self);

    /// A projector is loaded.
    fn is_multimodal_enabled(&self) -> bool;

    /// The projector accepts images.
    fn supports_vision(&self) -> bool;

    /// The projector accepts audio.
    fn supports_audio(&self) -> bool;

    // ── Completion ─────────────────────────────────────────────────

    /// Install sampling parameters for the next completion.
    fn set_sampling(&mut self, config: &GenerationConfig);

    /// Build the sampler from the installed parameters.
    fn init_sampling(&mut self) -> bool;

    /// Reset per-completion state.
    fn rewind(&mut self);

    /// Evaluate the prompt. Returns the prompt token count.
    ///
    /// # Errors
    ///
    /// Prompt evaluation failures, or media given without a projector.
    fn load_prompt(&mut self, prompt: &str, media_paths: &[String]) -> kiln_core::Result<usize>;

    /// Start sampling.
    fn begin_completion(&mut self);

    /// More tokens can be sampled.
    fn has_next_token(&self) -> bool;

    /// Sample and decode one token.
    ///
    /// # Errors
    ///
    /// Decode failures.
    fn do_completion(&mut self) -> kiln_core::Result<TokenOutput>;

    /// Finish sampling.
    fn end_completion(&mut self);

    // ── Other workloads ────────────────────────────────────────────

    /// Embedding vector for `text`.
    ///
    /// # Errors
    ///
    /// The model was not loaded in embedding mode, or evaluation failed.
    fn embedding(&mut self, text: &str) -> kiln_core::Result<Vec<f32>>;

    /// Run the engine benchmark. Returns the engine's JSON array, `"[]"` on
    /// failure.
    fn bench(&mut self, params: &BenchParams) -> String;

    /// Render messages into a prompt.
    fn format_chat(&self, messages: &[Message], template: Option<&str>) -> String {
        let _ = template;
        chat::chatml(messages)
    }
}
