//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format. Each type implements [`Default`] with production values, and
//! `#[serde(default)]` lets a partial file fill the rest from those defaults.

mod context;
mod generation;
mod model;

pub use context::*;
pub use generation::*;
pub use model::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the phi chat runner.
///
/// Loaded from `~/.phi/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "model": { "modelDir": "/opt/phi4" },
///   "context": { "maxContextTokens": 4096 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhiSettings {
    /// Model files and runtime threading.
    pub model: ModelSettings,
    /// Conversation budget and default system message.
    pub context: ContextSettings,
    /// Generator parameters.
    pub generation: GenerationSettings,
    /// Chat template role and end markers.
    pub template: TemplateSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl PhiSettings {
    /// Reject values that would make the runner misbehave.
    ///
    /// Zero counts and empty template markers are rejected; everything else
    /// is accepted as-is.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("context.maxContextTokens", self.context.max_context_tokens),
            (
                "context.averageCharsPerToken",
                self.context.average_chars_per_token,
            ),
            ("generation.maxLength", self.generation.max_length),
            ("generation.batchSize", self.generation.batch_size),
            ("generation.channelCapacity", self.generation.channel_capacity),
            ("model.intraThreads", self.model.intra_threads),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
            }
        }

        let markers = [
            ("template.systemToken", &self.template.system_token),
            ("template.userToken", &self.template.user_token),
            ("template.assistantToken", &self.template.assistant_token),
            ("template.endToken", &self.template.end_token),
        ];
        for (key, value) in markers {
            if value.is_empty() {
                return Err(SettingsError::InvalidValue(format!("{key} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `tracing` filter directive (e.g. `"warn"`, `"phi_engine=debug"`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
