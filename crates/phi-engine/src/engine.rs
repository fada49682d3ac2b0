//! Inference engine seam.
//!
//! The chat pipeline only needs four capabilities from a model runtime:
//! tokenize a prompt, advance a generator one token at a time, read the
//! newest token, and turn tokens back into text. These traits capture that
//! surface so the session logic can run against a real model or a scripted
//! stand-in.

use std::sync::Arc;

use async_trait::async_trait;
use phi_settings::GenerationSettings;

use crate::errors::Result;

/// Per-turn generator parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratorParams {
    /// Maximum sequence length, prompt tokens included.
    pub max_length: usize,
    /// Number of sequences generated in parallel.
    pub batch_size: usize,
}

impl GeneratorParams {
    /// Build from loaded settings.
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            max_length: settings.max_length,
            batch_size: settings.batch_size,
        }
    }
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self::from_settings(&GenerationSettings::default())
    }
}

/// A loaded model that can start generators and decoders.
///
/// Calls are synchronous and may block for a long time; run them off the
/// async executor.
pub trait InferenceEngine: Send + Sync {
    /// Whether the model is loaded and usable.
    fn is_ready(&self) -> bool;

    /// Tokenize a prompt.
    fn encode(&self, prompt: &str) -> Result<Vec<u32>>;

    /// Start a new generator.
    fn create_generator(&self, params: &GeneratorParams) -> Result<Box<dyn TokenGenerator>>;

    /// Start a new stream decoder.
    fn create_decoder(&self) -> Result<Box<dyn TokenDecoder>>;
}

/// Token-by-token generation state for one sequence.
pub trait TokenGenerator: Send {
    /// Feed prompt tokens before the first step.
    fn append_tokens(&mut self, tokens: &[u32]) -> Result<()>;

    /// Whether generation has ended (end-of-sequence or length limit).
    fn is_done(&self) -> bool;

    /// Produce the next token.
    fn step(&mut self) -> Result<()>;

    /// The token produced by the latest step.
    fn last_token(&self) -> Result<u32>;
}

/// Stateful token-to-text decoder.
///
/// A token may decode to an empty string when it only completes together
/// with a later one (e.g. a partial multi-byte character).
pub trait TokenDecoder: Send {
    /// Decode the next token of the stream.
    fn decode(&mut self, token: u32) -> Result<String>;
}

/// Loads an engine, typically from disk.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Load the model. May be slow; callers share one load.
    async fn load(&self) -> Result<Arc<dyn InferenceEngine>>;
}
