//! Conversation messages.
//!
//! A [`Message`] is one turn of the transcript. Once a message is appended to
//! a history it is only reachable through shared references, so it is
//! immutable in practice. The single exception is the in-progress assistant
//! reply of a streaming turn: it starts as an empty [`Message::placeholder`]
//! and grows through [`Message::push_text`] until the turn commits it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Average characters per token used by [`estimate_tokens`] when no budget
/// configuration overrides it.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the whole conversation.
    System,
    /// Text typed by the person chatting.
    User,
    /// Text produced by the model.
    Assistant,
}

impl Role {
    /// Lowercase name, as used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimate the token count of `text`.
///
/// `max(1, chars / chars_per_token + 1)`. Deterministic and deliberately
/// coarse: it only decides when old turns are evicted, it never feeds the
/// engine. A `chars_per_token` of zero is treated as one.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars = text.chars().count();
    (chars / chars_per_token.max(1) + 1).max(1)
}

/// One turn of the conversation transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    role: Role,
    text: String,
    token_estimate: usize,
}

impl Message {
    /// Create a message, estimating its tokens with `chars_per_token`.
    pub fn new(role: Role, text: impl Into<String>, chars_per_token: usize) -> Self {
        let text = text.into();
        let token_estimate = estimate_tokens(&text, chars_per_token);
        Self {
            role,
            text,
            token_estimate,
        }
    }

    /// Create an empty message whose text will be filled incrementally.
    pub fn placeholder(role: Role) -> Self {
        Self::new(role, String::new(), DEFAULT_CHARS_PER_TOKEN)
    }

    /// Who authored this message.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Message text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Estimated token count (always at least 1).
    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    /// Whether the message has no text yet.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Append a streamed fragment to the text.
    ///
    /// The token estimate is left untouched; it is recomputed when the
    /// reply is committed to a history.
    pub fn push_text(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    /// Remove `fragment` from the end of the text.
    ///
    /// Returns `false` and leaves the text alone when it does not end with
    /// `fragment`.
    pub fn pop_text(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() || !self.text.ends_with(fragment) {
            return false;
        }
        self.text.truncate(self.text.len() - fragment.len());
        true
    }

    /// Consume the message, returning its text.
    pub fn into_text(self) -> String {
        self.text
    }
}
