//! # phi-context
//!
//! Conversation state and prompt construction.
//!
//! - [`ConversationHistory`]: ordered transcript with a token budget. The
//!   system message is pinned at index 0; the oldest other messages are
//!   evicted first when the budget is exceeded.
//! - [`ChatTemplate`]: role and end markers, plus the rules for cleaning raw
//!   decoded fragments and spotting stop markers.
//! - [`PromptAssembler`]: renders a history into the flat prompt string.

#![deny(unsafe_code)]

pub mod history;
pub mod prompt;
pub mod template;

pub use history::{BudgetConfig, ConversationHistory};
pub use prompt::PromptAssembler;
pub use template::ChatTemplate;
