//! Processor, session registry and logging settings.

use serde::{Deserialize, Serialize};

/// Background task processor settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorSettings {
    /// Maximum number of tasks executing at once.
    pub max_concurrent_tasks: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
        }
    }
}

/// Session registry settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Hard cap on live sessions. Creation beyond it is refused.
    pub max_concurrent_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `"warn"` or `"kiln_tasks=debug"`.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
