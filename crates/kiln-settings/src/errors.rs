//! Errors raised while loading settings.

use thiserror::Error;

/// Why a settings file could not be turned into [`KilnSettings`](crate::KilnSettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON, or does not match the schema.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but is out of range.
    #[error("invalid setting: {0}")]
    InvalidValue(String),
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn json_failures_convert() {
        let err: SettingsError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_matches!(err, SettingsError::Json(_));
        assert!(err.to_string().starts_with("malformed settings"));
    }

    #[test]
    fn invalid_value_message() {
        let err = SettingsError::InvalidValue("maxConcurrentTasks must be positive".into());
        assert_eq!(err.to_string(), "invalid setting: maxConcurrentTasks must be positive");
    }
}
