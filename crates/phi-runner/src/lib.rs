//! # phi-runner
//!
//! The single entry point a front-end talks to. [`RunnerFacade`] owns the
//! conversation history and the loaded engine:
//!
//! - [`RunnerFacade::initialize`] loads the model once, however many callers race
//! - [`RunnerFacade::ready_signal`] fires once when the model is usable
//! - [`RunnerFacade::start_new_conversation`] resets the transcript
//! - [`RunnerFacade::submit_user_turn`] streams the assistant reply

#![deny(unsafe_code)]

pub mod facade;

pub use facade::{FragmentStream, RunnerConfig, RunnerFacade};
