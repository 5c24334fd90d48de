//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement [`Default`]
//! with production values. Types marked with `#[serde(default)]` accept
//! partial JSON; missing fields get their default during deserialization.

mod context;
mod generation;
mod model;
mod runtime;

pub use context::*;
pub use generation::*;
pub use model::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};

/// Root settings type for the kiln runtime.
///
/// # JSON Format
///
/// ```json
/// {
///   "processor": { "maxConcurrentTasks": 4 },
///   "context": { "retentionStrategy": "tokenBased", "maxContextTokens": 2048 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KilnSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Background task processor settings.
    pub processor: ProcessorSettings,
    /// Session registry settings.
    pub sessions: SessionSettings,
    /// Global context-window defaults.
    pub context: ContextSettings,
    /// Default generation parameters for new sessions.
    pub generation: GenerationConfig,
    /// Model to load at startup, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for KilnSettings {
    fn default() -> Self {
        Self {
            version: kiln_core::constants::VERSION.to_string(),
            name: kiln_core::constants::NAME.to_string(),
            processor: ProcessorSettings::default(),
            sessions: SessionSettings::default(),
            context: ContextSettings::default(),
            generation: GenerationConfig::default(),
            model: None,
            logging: LoggingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_without_model() {
        let json = serde_json::to_value(KilnSettings::default()).unwrap();
        assert_eq!(json["processor"]["maxConcurrentTasks"], 2);
        assert_eq!(json["sessions"]["maxConcurrentSessions"], 5);
        assert_eq!(json["context"]["retentionStrategy"], "keepAll");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: KilnSettings =
            serde_json::from_str(r#"{"context": {"maxMessages": 12}}"#).unwrap();
        assert_eq!(settings.context.max_messages, 12);
        assert_eq!(settings.context.max_context_tokens, 4096);
        assert_eq!(settings.processor.max_concurrent_tasks, 2);
    }

    #[test]
    fn model_section_round_trips() {
        let settings: KilnSettings =
            serde_json::from_str(r#"{"model": {"modelPath": "/models/q4.gguf", "gpuLayers": 0}}"#)
                .unwrap();
        let model = settings.model.unwrap();
        assert_eq!(model.model_path, "/models/q4.gguf");
        assert_eq!(model.gpu_layers, 0);
        assert_eq!(model.context_size, 4096);
    }
}
