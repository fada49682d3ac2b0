//! Conversation budget and chat template settings.

use serde::{Deserialize, Serialize};

/// Token budget and conversation defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Upper bound on the estimated tokens kept in the history.
    pub max_context_tokens: usize,
    /// Characters per token used by the estimate.
    pub average_chars_per_token: usize,
    /// System text used when a conversation starts without one.
    pub default_system_message: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 128_000,
            average_chars_per_token: 4,
            default_system_message: "Starting new chat session.".to_string(),
        }
    }
}

/// Role and end markers of the chat template.
///
/// Defaults are the Phi family markers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateSettings {
    /// Opens the system message.
    pub system_token: String,
    /// Opens a user message.
    pub user_token: String,
    /// Opens an assistant message.
    pub assistant_token: String,
    /// Closes any message.
    pub end_token: String,
    /// Other control tokens that end the reply, such as the end-of-text
    /// token. Stripped from output like the end marker.
    pub stop_tokens: Vec<String>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            system_token: "<|system|>".to_string(),
            user_token: "<|user|>".to_string(),
            assistant_token: "<|assistant|>".to_string(),
            end_token: "<|end|>".to_string(),
            stop_tokens: vec!["<|endoftext|>".to_string()],
        }
    }
}
