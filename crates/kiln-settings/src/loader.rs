//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KilnSettings::default()`]
//! 2. If `~/.kiln/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `KILN_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use kiln_core::constants::ENV_PREFIX;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{KilnSettings, ModelConfig, RetentionStrategy};

/// Resolve the path to the settings file (`~/.kiln/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".kiln").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<KilnSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON, or JSON that violates the
/// schema, is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KilnSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    check_limits(&settings)?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<KilnSettings> {
    let defaults = serde_json::to_value(KilnSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

fn check_limits(settings: &KilnSettings) -> Result<()> {
    if settings.processor.max_concurrent_tasks == 0 {
        return Err(SettingsError::InvalidValue(
            "processor.maxConcurrentTasks must be at least 1".into(),
        ));
    }
    if settings.context.max_messages == 0 {
        return Err(SettingsError::InvalidValue(
            "context.maxMessages must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `KILN_*` environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in effect.
pub fn apply_env_overrides(settings: &mut KilnSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Keys are looked up with the `KILN_` prefix, e.g. `KILN_MAX_TASKS`.
pub fn apply_overrides_from<F>(settings: &mut KilnSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |suffix: &str| {
        let key = format!("{ENV_PREFIX}{suffix}");
        lookup(&key)
            .filter(|v| !v.is_empty())
            .map(|v| (key, v))
    };

    if let Some(v) = read("MAX_TASKS").and_then(|(k, v)| checked(&k, &v, parse_usize_range(&v, 1, 64))) {
        settings.processor.max_concurrent_tasks = v;
    }
    if let Some(v) = read("MAX_SESSIONS").and_then(|(k, v)| checked(&k, &v, parse_usize_range(&v, 1, 10_000))) {
        settings.sessions.max_concurrent_sessions = v;
    }
    if let Some(v) = read("MAX_CONTEXT_TOKENS")
        .and_then(|(k, v)| checked(&k, &v, parse_usize_range(&v, 16, 1_048_576)))
    {
        settings.context.max_context_tokens = v;
    }
    if let Some(v) = read("MAX_MESSAGES").and_then(|(k, v)| checked(&k, &v, parse_usize_range(&v, 1, 100_000))) {
        settings.context.max_messages = v;
    }
    if let Some(v) = read("RETENTION_STRATEGY").and_then(|(k, v)| checked(&k, &v, parse_strategy(&v))) {
        settings.context.retention_strategy = v;
    }
    if let Some(v) = read("AUTO_CLEANUP").and_then(|(k, v)| checked(&k, &v, parse_bool(&v))) {
        settings.context.enable_auto_cleanup = v;
    }
    if let Some((_, v)) = read("LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some((_, v)) = read("MODEL_PATH") {
        match settings.model.as_mut() {
            Some(model) => model.model_path = v,
            None => settings.model = Some(ModelConfig::with_model_path(v)),
        }
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a retention strategy by its camelCase wire name.
pub fn parse_strategy(val: &str) -> Option<RetentionStrategy> {
    serde_json::from_value(Value::String(val.trim().to_string())).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
