//! # phi-settings
//!
//! Layered configuration for the phi chat runner.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`PhiSettings::default()`]
//! 2. **User file**: `~/.phi/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PHI_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<PhiSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.phi/settings.json` with env var
/// overrides. If loading fails, the failure is logged and compiled
/// defaults are used.
pub fn get_settings() -> &'static PhiSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to load settings, using defaults");
            PhiSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: PhiSettings) -> std::result::Result<(), PhiSettings> {
    SETTINGS.set(settings)
}
