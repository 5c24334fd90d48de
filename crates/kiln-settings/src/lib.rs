//! # kiln-settings
//!
//! Configuration management with layered sources for the kiln runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`KilnSettings::default()`]
//! 2. **User file**: `~/.kiln/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `KILN_*` overrides (highest priority)
//!
//! Components never read the global instance themselves; the host loads
//! settings once and hands the relevant section to each service it builds.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Process-wide settings for binaries that want one.
static SETTINGS: OnceLock<KilnSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.kiln/settings.json` with env var
/// overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static KilnSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// # Errors
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: KilnSettings) -> std::result::Result<(), KilnSettings> {
    SETTINGS.set(settings)
}
