//! # phi-engine
//!
//! Inference engine seam and streaming generation.
//!
//! - [`InferenceEngine`], [`TokenGenerator`], [`TokenDecoder`], [`EngineLoader`]:
//!   the capabilities the chat pipeline needs from a model runtime
//! - [`StreamingSession`]: one turn, yielding cleaned text fragments and
//!   committing the reply when it ends
//! - [`ScriptedEngine`]: deterministic engine for tests and demos
//! - `OnnxEngine` (feature `ort`): local ONNX Runtime model with a
//!   `tokenizers` tokenizer, fetched through `hf-hub` when missing

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod errors;
#[cfg(feature = "ort")]
pub mod onnx;
pub mod scripted;
pub mod session;

pub use config::EngineConfig;
pub use engine::{EngineLoader, GeneratorParams, InferenceEngine, TokenDecoder, TokenGenerator};
pub use errors::{EngineError, Result};
#[cfg(feature = "ort")]
pub use onnx::{OnnxEngine, OnnxLoader};
pub use scripted::{ScriptedEngine, ScriptedLoader};
pub use session::{SessionOptions, SessionState, StreamingSession, TurnOutcome};
