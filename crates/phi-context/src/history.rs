//! Token-budgeted conversation history.
//!
//! Invariants held after every public mutation:
//!
//! - element 0 is the one and only `System` message
//! - `total_tokens` equals the sum of the messages' estimates
//! - `total_tokens <= max_context_tokens`, unless only the system message
//!   and the newest message remain

use phi_core::{ChatError, Message, Result, Role};
use phi_settings::ContextSettings;
use tracing::debug;

/// Budget applied by [`ConversationHistory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetConfig {
    /// Upper bound on the summed token estimates.
    pub max_context_tokens: usize,
    /// Characters per token used when estimating new messages.
    pub average_chars_per_token: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::from_settings(&ContextSettings::default())
    }
}

impl BudgetConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &ContextSettings) -> Self {
        Self {
            max_context_tokens: settings.max_context_tokens,
            average_chars_per_token: settings.average_chars_per_token,
        }
    }
}

/// Ordered chat transcript with a running token total.
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    total_tokens: usize,
    budget: BudgetConfig,
}

impl ConversationHistory {
    /// Create a history holding only `system_text`.
    pub fn new(system_text: &str, budget: BudgetConfig) -> Self {
        let mut history = Self {
            messages: Vec::new(),
            total_tokens: 0,
            budget,
        };
        history.reset(system_text);
        history
    }

    /// Drop every message and start over with `system_text`.
    pub fn reset(&mut self, system_text: &str) {
        self.messages.clear();
        self.messages.push(Message::new(
            Role::System,
            system_text.trim(),
            self.budget.average_chars_per_token,
        ));
        self.total_tokens = self.messages.iter().map(Message::token_estimate).sum();
        debug!(tokens = self.total_tokens, "conversation reset");
    }

    /// Append a user or assistant message, trimming its text, then evict.
    ///
    /// The system message is only ever created by [`reset`](Self::reset);
    /// appending `Role::System` fails with [`ChatError::InvalidState`].
    pub fn append(&mut self, role: Role, text: &str) -> Result<()> {
        self.push(role, text.trim())
    }

    /// Append a finished assistant reply exactly as streamed, then evict.
    ///
    /// Unlike [`append`](Self::append) the text is not trimmed, so the stored
    /// reply equals the concatenation of the fragments the caller saw.
    pub fn commit_reply(&mut self, text: &str) -> Result<()> {
        self.push(Role::Assistant, text)
    }

    fn push(&mut self, role: Role, text: &str) -> Result<()> {
        if role == Role::System {
            return Err(ChatError::invalid_state(
                "system message can only be set by reset",
            ));
        }
        let message = Message::new(role, text, self.budget.average_chars_per_token);
        self.total_tokens += message.token_estimate();
        debug!(
            role = role.as_str(),
            tokens = message.token_estimate(),
            total = self.total_tokens,
            "message appended"
        );
        self.messages.push(message);
        let _ = self.evict_to_limit();
        Ok(())
    }

    /// Remove the oldest non-system messages until the budget holds or only
    /// the system message and the newest message remain.
    ///
    /// Returns the number of messages removed.
    pub fn evict_to_limit(&mut self) -> usize {
        let mut removed = 0;
        while self.total_tokens > self.budget.max_context_tokens && self.messages.len() > 2 {
            let oldest = self.messages.remove(1);
            self.total_tokens -= oldest.token_estimate();
            removed += 1;
        }
        if removed > 0 {
            debug!(
                removed,
                total = self.total_tokens,
                max = self.budget.max_context_tokens,
                "evicted oldest messages"
            );
        }
        removed
    }

    /// Messages in conversation order, system message first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The pinned system message.
    pub fn system_message(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role() == Role::System)
    }

    /// Number of messages, system message included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history holds no messages at all.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of the messages' token estimates.
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// Configured budget ceiling.
    pub fn max_context_tokens(&self) -> usize {
        self.budget.max_context_tokens
    }

    /// Budget this history enforces.
    pub fn budget(&self) -> BudgetConfig {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn budget(max: usize) -> BudgetConfig {
        BudgetConfig {
            max_context_tokens: max,
            average_chars_per_token: 4,
        }
    }

    fn roles(history: &ConversationHistory) -> Vec<Role> {
        history.messages().iter().map(Message::role).collect()
    }

    #[test]
    fn new_history_holds_only_system() {
        let history = ConversationHistory::new("Begin.", BudgetConfig::default());
        assert_eq!(history.len(), 1);
        assert_eq!(history.system_message().unwrap().text(), "Begin.");
        assert_eq!(history.total_tokens(), 2);
        assert_eq!(history.max_context_tokens(), 128_000);
    }

    #[test]
    fn append_trims_and_counts() {
        let mut history = ConversationHistory::new("Begin.", BudgetConfig::default());
        history.append(Role::User, "  Hi \n").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].text(), "Hi");
        assert_eq!(history.total_tokens(), 2 + 1);
    }

    #[test]
    fn commit_reply_keeps_text_verbatim() {
        let mut history = ConversationHistory::new("Begin.", BudgetConfig::default());
        history.commit_reply("Hello \n").unwrap();
        assert_eq!(history.messages()[1].text(), "Hello \n");
        assert_eq!(history.messages()[1].role(), Role::Assistant);
    }

    #[test]
    fn append_system_rejected() {
        let mut history = ConversationHistory::new("Begin.", BudgetConfig::default());
        assert_matches!(
            history.append(Role::System, "again"),
            Err(ChatError::InvalidState(_))
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn reset_replaces_everything() {
        let mut history = ConversationHistory::new("Begin.", BudgetConfig::default());
        history.append(Role::User, "one").unwrap();
        history.append(Role::Assistant, "two").unwrap();
        history.reset("  Fresh start  ");
        assert_eq!(history.len(), 1);
        assert_eq!(history.system_message().unwrap().text(), "Fresh start");
        assert_eq!(history.total_tokens(), 3);
    }

    #[test]
    fn oversized_message_kept_with_system() {
        let mut history = ConversationHistory::new("Sys", budget(3));
        history.append(Role::User, "Hello there").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.total_tokens(), 1 + 3);
    }

    #[test]
    fn eviction_removes_oldest_non_system() {
        let mut history = ConversationHistory::new("Sys", budget(3));
        history.append(Role::User, "Hello there").unwrap();
        history.append(Role::Assistant, "abc").unwrap();
        assert_eq!(roles(&history), vec![Role::System, Role::Assistant]);
        assert_eq!(history.messages()[1].text(), "abc");
        assert_eq!(history.total_tokens(), 2);
    }

    #[test]
    fn eviction_stops_once_budget_holds() {
        let mut history = ConversationHistory::new("Sys", budget(4));
        for text in ["a", "b", "c"] {
            history.append(Role::User, text).unwrap();
        }
        // 1 + 1 + 1 + 1 = 4: nothing evicted yet
        assert_eq!(history.len(), 4);
        history.append(Role::Assistant, "d").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.messages()[1].text(), "b");
        assert_eq!(history.total_tokens(), 4);
    }

    #[test]
    fn evict_to_limit_is_noop_under_budget() {
        let mut history = ConversationHistory::new("Sys", BudgetConfig::default());
        history.append(Role::User, "hi").unwrap();
        assert_eq!(history.evict_to_limit(), 0);
        assert_eq!(history.len(), 2);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn turn() -> impl Strategy<Value = (bool, String)> {
            (any::<bool>(), "[a-z ]{0,40}")
        }

        proptest! {
            #[test]
            fn budget_invariant_holds(
                max in 1usize..40,
                system in "[a-z]{0,20}",
                turns in proptest::collection::vec(turn(), 0..30),
            ) {
                let mut history = ConversationHistory::new(&system, budget(max));
                for (is_user, text) in turns {
                    let role = if is_user { Role::User } else { Role::Assistant };
                    history.append(role, &text).unwrap();

                    prop_assert_eq!(history.messages()[0].role(), Role::System);
                    prop_assert_eq!(history.messages()[0].text(), system.as_str());
                    prop_assert!(
                        history.messages()[1..].iter().all(|m| m.role() != Role::System)
                    );
                    let sum: usize = history.messages().iter().map(Message::token_estimate).sum();
                    prop_assert_eq!(history.total_tokens(), sum);
                    prop_assert!(history.total_tokens() <= max || history.len() <= 2);
                }
            }
        }
    }
}
