//! Error taxonomy for the kiln runtime.
//!
//! Every fallible operation in the workspace reports a [`KilnError`]. Engine
//! faults raised inside a task body are converted into a `KilnError` at the
//! task boundary; session preconditions are reported synchronously with the
//! same type. Each variant maps to a stable numeric [`code`](KilnError::code)
//! so outer layers (FFI, RPC) can surface it without string matching.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Top-level error type for the kiln runtime.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KilnError {
    /// Unexpected engine-level fault (including panics caught at a task boundary).
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// An operation needed a loaded model and none is loaded.
    #[error("Model not loaded")]
    ModelNotLoaded,

    /// The engine refused to load the model.
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// Generation was cancelled before it produced a result.
    #[error("Generation cancelled")]
    GenerationCancelled,

    /// A configuration or call argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The native backend reported an error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A referenced file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The engine failed while producing tokens.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// A multimodal operation was requested without a projector loaded.
    #[error("Multimodal support is not enabled")]
    MultimodalNotEnabled,

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The multimodal projector could not be initialised.
    #[error("Multimodal init failed: {0}")]
    MultimodalInitFailed(String),

    /// LoRA adapters could not be applied.
    #[error("LoRA application failed: {0}")]
    LoraApplicationFailed(String),

    /// Text could not be converted to tokens.
    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    /// Tokens could not be converted to text.
    #[error("Detokenization failed: {0}")]
    DetokenizationFailed(String),

    /// The model file is not a usable model.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// No session with the given ID is registered.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The registry already holds the maximum number of live sessions.
    #[error("Session limit reached ({0})")]
    SessionLimitReached(usize),
}

impl KilnError {
    /// Create an invalid-state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Stable numeric error code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown(_) => -1,
            Self::ModelNotLoaded => -2,
            Self::ModelLoadFailed(_) => -3,
            Self::GenerationCancelled => -4,
            Self::InvalidArgument(_) => -5,
            Self::Backend(_) => -6,
            Self::FileNotFound(_) => -7,
            Self::GenerationFailed(_) => -8,
            Self::MultimodalNotEnabled => -9,
            Self::InvalidState(_) => -10,
            Self::MultimodalInitFailed(_) => -11,
            Self::LoraApplicationFailed(_) => -12,
            Self::TokenizationFailed(_) => -13,
            Self::DetokenizationFailed(_) => -14,
            Self::InvalidModel(_) => -15,
            Self::SessionNotFound(_) => -16,
            Self::SessionLimitReached(_) => -17,
        }
    }

    /// Error category string for event emission and logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unknown(_) => "unknown",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::ModelLoadFailed(_) => "model_load_failed",
            Self::GenerationCancelled => "cancelled",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Backend(_) => "backend",
            Self::FileNotFound(_) => "file_not_found",
            Self::GenerationFailed(_) => "generation_failed",
            Self::MultimodalNotEnabled => "multimodal_not_enabled",
            Self::InvalidState(_) => "invalid_state",
            Self::MultimodalInitFailed(_) => "multimodal_init_failed",
            Self::LoraApplicationFailed(_) => "lora_application_failed",
            Self::TokenizationFailed(_) => "tokenization_failed",
            Self::DetokenizationFailed(_) => "detokenization_failed",
            Self::InvalidModel(_) => "invalid_model",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionLimitReached(_) => "session_limit_reached",
        }
    }

    /// Whether the caller can reasonably retry the same operation later.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ModelNotLoaded
            | Self::GenerationCancelled
            | Self::InvalidState(_)
            | Self::SessionLimitReached(_)
            | Self::GenerationFailed(_)
            | Self::Backend(_) => true,
            Self::Unknown(_)
            | Self::ModelLoadFailed(_)
            | Self::InvalidArgument(_)
            | Self::FileNotFound(_)
            | Self::MultimodalNotEnabled
            | Self::MultimodalInitFailed(_)
            | Self::LoraApplicationFailed(_)
            | Self::TokenizationFailed(_)
            | Self::DetokenizationFailed(_)
            | Self::InvalidModel(_)
            | Self::SessionNotFound(_) => false,
        }
    }

    /// Whether this error represents a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::GenerationCancelled)
    }
}
