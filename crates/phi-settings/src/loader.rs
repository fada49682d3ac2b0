//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PhiSettings::default()`]
//! 2. If `~/.phi/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PHI_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::PhiSettings;

/// Resolve the path to the settings file (`~/.phi/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".phi").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PhiSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PhiSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<PhiSettings> {
    let defaults = serde_json::to_value(PhiSettings::default())?;

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

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (file/default value wins).
pub fn apply_env_overrides(settings: &mut PhiSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
///
/// [`apply_env_overrides`] delegates here; tests pass a map.
pub fn apply_overrides_from<F>(settings: &mut PhiSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let usize_in = |name: &str, min: usize, max: usize| {
        let val = lookup(name)?;
        let parsed = parse_usize_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    };

    // ── Model ───────────────────────────────────────────────────────
    if let Some(v) = string("PHI_MODEL_DIR") {
        settings.model.model_dir = v;
    }
    if let Some(v) = string("PHI_HF_REPO") {
        settings.model.hf_repo = Some(v);
    }
    if let Some(v) = usize_in("PHI_INTRA_THREADS", 1, 256) {
        settings.model.intra_threads = v;
    }

    // ── Context ─────────────────────────────────────────────────────
    if let Some(v) = usize_in("PHI_MAX_CONTEXT_TOKENS", 1, 10_000_000) {
        settings.context.max_context_tokens = v;
    }
    if let Some(v) = string("PHI_SYSTEM_MESSAGE") {
        settings.context.default_system_message = v;
    }

    // ── Generation ──────────────────────────────────────────────────
    if let Some(v) = usize_in("PHI_MAX_LENGTH", 1, 1_000_000) {
        settings.generation.max_length = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("PHI_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
