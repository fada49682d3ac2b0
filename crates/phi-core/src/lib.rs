//! # phi-core
//!
//! Foundation types, errors, and logging for the phi chat runner.
//!
//! This crate provides the shared vocabulary that all other phi crates depend on:
//!
//! - **Messages**: [`Role`] and [`Message`], one turn of the transcript
//! - **Token estimate**: the coarse chars-per-token heuristic that gates eviction
//! - **Errors**: [`ChatError`], the taxonomy surfaced to callers of the runner
//! - **Logging**: `tracing` subscriber setup and an in-memory capture layer for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod logging;
pub mod messages;

pub use errors::{ChatError, Result};
pub use messages::{DEFAULT_CHARS_PER_TOKEN, Message, Role, estimate_tokens};
