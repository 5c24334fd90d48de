//! Model, multimodal projector and LoRA adapter configuration.

use std::path::Path;

use kiln_core::KilnError;
use serde::{Deserialize, Serialize};

/// Parameters for loading a model into the engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    /// Path to the model weights file.
    pub model_path: String,
    /// Context window size in tokens.
    pub context_size: u32,
    /// Logical batch size.
    pub batch_size: u32,
    /// Physical micro-batch size.
    pub ubatch_size: u32,
    /// Layers offloaded to the GPU (-1 = all the engine can take).
    pub gpu_layers: i32,
    /// Worker threads (0 = engine picks).
    pub threads: u32,
    /// Memory-map the weights.
    pub use_mmap: bool,
    /// Lock the weights in RAM.
    pub use_mlock: bool,
    /// Use flash attention kernels.
    pub flash_attention: bool,
    /// KV cache element type for keys.
    pub cache_type_k: String,
    /// KV cache element type for values.
    pub cache_type_v: String,
    /// Chat template override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
    /// Load in embedding mode.
    pub enable_embedding: bool,
    /// Embedding pooling type (engine enum value).
    pub pooling_type: i32,
    /// Embedding normalisation (-1 none, 2 euclidean).
    pub embedding_normalize: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            context_size: 4096,
            batch_size: 512,
            ubatch_size: 512,
            gpu_layers: -1,
            threads: 0,
            use_mmap: true,
            use_mlock: false,
            flash_attention: true,
            cache_type_k: "f16".to_string(),
            cache_type_v: "f16".to_string(),
            chat_template: None,
            enable_embedding: false,
            pooling_type: 0,
            embedding_normalize: -1,
        }
    }
}

impl ModelConfig {
    /// Default parameters for the given weights file.
    pub fn with_model_path(path: impl Into<String>) -> Self {
        Self {
            model_path: path.into(),
            ..Self::default()
        }
    }

    /// Check that the configuration can be handed to the engine.
    ///
    /// # Errors
    ///
    /// [`KilnError::InvalidArgument`] for an empty path or zero sizes,
    /// [`KilnError::FileNotFound`] when the weights file does not exist.
    pub fn validate(&self) -> kiln_core::Result<()> {
        if self.model_path.trim().is_empty() {
            return Err(KilnError::invalid_argument("modelPath is required"));
        }
        if self.context_size == 0 {
            return Err(KilnError::invalid_argument("contextSize must be positive"));
        }
        if self.batch_size == 0 || self.ubatch_size == 0 {
            return Err(KilnError::invalid_argument("batch sizes must be positive"));
        }
        if !Path::new(&self.model_path).is_file() {
            return Err(KilnError::FileNotFound(self.model_path.clone()));
        }
        Ok(())
    }
}

/// Multimodal projector configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MultimodalConfig {
    /// Path to the projector weights.
    pub mmproj_path: String,
    /// Run the projector on the GPU.
    pub use_gpu: bool,
    /// Accept image inputs.
    pub enable_vision: bool,
    /// Accept audio inputs.
    pub enable_audio: bool,
    /// Optional vocoder for speech output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocoder_path: Option<String>,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            mmproj_path: String::new(),
            use_gpu: true,
            enable_vision: true,
            enable_audio: true,
            vocoder_path: None,
        }
    }
}

impl MultimodalConfig {
    /// Vision-only projector.
    pub fn vision_only(mmproj_path: impl Into<String>) -> Self {
        Self {
            mmproj_path: mmproj_path.into(),
            enable_audio: false,
            ..Self::default()
        }
    }

    /// Audio-only projector.
    pub fn audio_only(mmproj_path: impl Into<String>) -> Self {
        Self {
            mmproj_path: mmproj_path.into(),
            enable_vision: false,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// [`KilnError::InvalidArgument`] for an empty path,
    /// [`KilnError::FileNotFound`] when the projector file is missing.
    pub fn validate(&self) -> kiln_core::Result<()> {
        if self.mmproj_path.trim().is_empty() {
            return Err(KilnError::invalid_argument("mmprojPath is required"));
        }
        if !Path::new(&self.mmproj_path).is_file() {
            return Err(KilnError::FileNotFound(self.mmproj_path.clone()));
        }
        Ok(())
    }
}

/// One LoRA adapter and its blend scale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoraAdapter {
    /// Path to the adapter weights.
    pub path: String,
    /// Blend scale.
    #[serde(default = "default_lora_scale")]
    pub scale: f32,
}

fn default_lora_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    /// Adapter at full scale.
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_scale(path, default_lora_scale())
    }

    /// Adapter at a custom scale.
    pub fn with_scale(path: impl Into<String>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}
