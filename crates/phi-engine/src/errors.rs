//! Engine error types.
//!
//! Inside a streaming turn these never reach the caller: the session logs
//! them and ends the stream. They surface only from model loading and from
//! the pre-flight readiness check.

use phi_core::ChatError;
use thiserror::Error;

/// Errors from the inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Model or tokenizer could not be loaded.
    #[error("Model initialization failed: {0}")]
    ModelInit(String),

    /// Encoding, generation, or decoding failed.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Engine not ready (model not loaded).
    #[error("Inference engine not ready")]
    NotReady,

    /// Generic internal error (e.g. a blocking task panicked).
    #[error("{0}")]
    Internal(String),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for ChatError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotReady => Self::NotReady,
            other => Self::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn error_display_variants() {
        let cases = vec![
            (
                EngineError::ModelInit("no tokenizer.json".into()),
                "Model initialization failed: no tokenizer.json",
            ),
            (
                EngineError::Inference("bad shape".into()),
                "Inference failed: bad shape",
            ),
            (EngineError::NotReady, "Inference engine not ready"),
            (EngineError::Internal("join error".into()), "join error"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn not_ready_maps_to_chat_not_ready() {
        assert_matches!(ChatError::from(EngineError::NotReady), ChatError::NotReady);
    }

    #[test]
    fn other_errors_map_to_chat_engine() {
        assert_matches!(
            ChatError::from(EngineError::ModelInit("missing".into())),
            ChatError::Engine(msg) if msg == "Model initialization failed: missing"
        );
    }
}
