//! Error taxonomy surfaced to callers of the chat runner.
//!
//! Only pre-flight and contract violations reach callers. Failures inside the
//! token loop are contained by the streaming session and end the turn early
//! instead of surfacing here.

use thiserror::Error;

/// Errors returned by conversation and runner operations.
///
/// `Clone` so one failed model load can be handed to every waiter.
#[derive(Clone, Debug, Error)]
pub enum ChatError {
    /// The inference engine has not finished loading.
    #[error("Model is not ready")]
    NotReady,

    /// The call sequence is malformed (empty history, reset during a turn, ...).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The engine failed before a turn could start (e.g. model load).
    #[error("Engine failure: {0}")]
    Engine(String),
}

impl ChatError {
    /// Shorthand for [`ChatError::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady | Self::Engine(_))
    }
}

/// Result alias for chat operations.
pub type Result<T> = std::result::Result<T, ChatError>;
