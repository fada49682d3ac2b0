//! One streaming generation turn.
//!
//! A [`StreamingSession`] borrows the conversation history for exactly one
//! turn. Creating it appends the user message and assembles the prompt;
//! iterating it drives the engine one token at a time and yields cleaned,
//! non-empty text fragments. Whatever reply has accumulated is committed to
//! the history when the session ends, including when it is dropped early.
//!
//! Engine failures inside the token loop are logged and end the stream; they
//! are never returned to the consumer.

use phi_context::{ChatTemplate, ConversationHistory, PromptAssembler};
use phi_core::{ChatError, Message, Result, Role};
use phi_settings::PhiSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{GeneratorParams, InferenceEngine, TokenDecoder, TokenGenerator};

/// Lifecycle of a [`StreamingSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Prompt built, engine not yet touched.
    Idle,
    /// Engine is producing tokens.
    Streaming,
    /// Generation reached a stop marker or the generator finished.
    Completed,
    /// Cancellation was observed, or the session was dropped mid-stream.
    Cancelled,
    /// The engine reported an error.
    Failed,
}

impl SessionState {
    /// Whether the session can no longer yield fragments.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Per-turn options.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Generator parameters.
    pub params: GeneratorParams,
    /// Prompt framing and fragment cleaning.
    pub assembler: PromptAssembler,
}

impl SessionOptions {
    /// Build from loaded settings.
    pub fn from_settings(settings: &PhiSettings) -> Self {
        Self {
            params: GeneratorParams::from_settings(&settings.generation),
            assembler: PromptAssembler::new(ChatTemplate::from_settings(&settings.template)),
        }
    }
}

/// Summary of a finished turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Terminal state.
    pub state: SessionState,
    /// Assistant text added to the history, if any.
    pub committed_text: Option<String>,
    /// Number of fragments yielded.
    pub fragments: usize,
    /// Number of engine steps taken.
    pub tokens_generated: usize,
}

struct Pipeline {
    generator: Box<dyn TokenGenerator>,
    decoder: Box<dyn TokenDecoder>,
}

/// A single generation turn over a borrowed history.
pub struct StreamingSession<'a> {
    engine: &'a dyn InferenceEngine,
    history: &'a mut ConversationHistory,
    cancel: CancellationToken,
    options: SessionOptions,
    prompt: String,
    reply: Message,
    state: SessionState,
    pipeline: Option<Pipeline>,
    stop_pending: bool,
    fragments: usize,
    tokens_generated: usize,
    committed: Option<String>,
    commit_done: bool,
}

impl<'a> StreamingSession<'a> {
    /// Start a turn for `user_text`.
    ///
    /// - engine not ready: [`ChatError::NotReady`], history untouched
    /// - blank `user_text`: an already-completed session, history untouched
    /// - `cancel` already triggered: an already-cancelled session, history
    ///   untouched
    ///
    /// Otherwise the trimmed user message is appended (with eviction), the
    /// prompt is assembled, and the session waits in [`SessionState::Idle`]
    /// for the first `next()`.
    pub fn generate(
        engine: &'a dyn InferenceEngine,
        history: &'a mut ConversationHistory,
        user_text: &str,
        cancel: CancellationToken,
        options: SessionOptions,
    ) -> Result<Self> {
        if !engine.is_ready() {
            return Err(ChatError::NotReady);
        }

        let mut session = Self {
            engine,
            history,
            cancel,
            options,
            prompt: String::new(),
            reply: Message::placeholder(Role::Assistant),
            state: SessionState::Idle,
            pipeline: None,
            stop_pending: false,
            fragments: 0,
            tokens_generated: 0,
            committed: None,
            commit_done: false,
        };

        if user_text.trim().is_empty() {
            debug!("blank user input ignored");
            session.state = SessionState::Completed;
            return Ok(session);
        }
        if session.cancel.is_cancelled() {
            debug!("turn cancelled before start");
            session.state = SessionState::Cancelled;
            return Ok(session);
        }

        session.history.append(Role::User, user_text)?;
        session.prompt = session.options.assembler.build(session.history.messages())?;
        debug!(
            messages = session.history.len(),
            history_tokens = session.history.total_tokens(),
            prompt_chars = session.prompt.len(),
            "turn started"
        );
        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The assistant reply accumulated so far.
    pub fn placeholder(&self) -> &Message {
        &self.reply
    }

    /// Prompt sent to the engine for this turn (empty for ignored turns).
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Take back the most recently yielded fragment.
    ///
    /// For consumers that could not deliver it: the fragment is removed from
    /// the reply so it is not committed. Has no effect once the reply has
    /// been committed or when `fragment` is not the tail of the reply.
    pub fn retract(&mut self, fragment: &str) -> bool {
        if self.commit_done || !self.reply.pop_text(fragment) {
            return false;
        }
        self.fragments = self.fragments.saturating_sub(1);
        debug!(chars = fragment.len(), "undelivered fragment retracted");
        true
    }

    /// End the session and report what happened.
    ///
    /// A session that has not reached a terminal state is treated as
    /// cancelled; its partial reply is still committed.
    pub fn finish(mut self) -> TurnOutcome {
        self.abandon();
        TurnOutcome {
            state: self.state,
            committed_text: self.committed.take(),
            fragments: self.fragments,
            tokens_generated: self.tokens_generated,
        }
    }

    fn abandon(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
        }
        self.commit();
    }

    fn end(&mut self, state: SessionState) {
        self.state = state;
        debug!(
            state = ?state,
            fragments = self.fragments,
            tokens = self.tokens_generated,
            "turn ended"
        );
        self.commit();
    }

    fn commit(&mut self) {
        if self.commit_done {
            return;
        }
        self.commit_done = true;
        if self.reply.is_empty() {
            return;
        }
        match self.history.commit_reply(self.reply.text()) {
            Ok(()) => self.committed = Some(self.reply.text().to_string()),
            Err(error) => warn!(%error, "failed to commit assistant reply"),
        }
    }

    fn start_pipeline(&self) -> crate::errors::Result<Pipeline> {
        let tokens = self.engine.encode(&self.prompt)?;
        let mut generator = self.engine.create_generator(&self.options.params)?;
        generator.append_tokens(&tokens)?;
        let decoder = self.engine.create_decoder()?;
        debug!(prompt_tokens = tokens.len(), "generator primed");
        Ok(Pipeline { generator, decoder })
    }

    /// Run one engine step. `None` once the generator is done.
    fn pull_raw(&mut self) -> crate::errors::Result<Option<String>> {
        if self.pipeline.is_none() {
            self.pipeline = Some(self.start_pipeline()?);
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Ok(None);
        };
        if pipeline.generator.is_done() {
            return Ok(None);
        }
        pipeline.generator.step()?;
        let token = pipeline.generator.last_token()?;
        self.tokens_generated += 1;
        pipeline.decoder.decode(token).map(Some)
    }
}

impl Iterator for StreamingSession<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            match self.state {
                SessionState::Idle => self.state = SessionState::Streaming,
                SessionState::Streaming => {}
                SessionState::Completed | SessionState::Cancelled | SessionState::Failed => {
                    return None;
                }
            }

            if self.stop_pending {
                self.end(SessionState::Completed);
                continue;
            }
            if self.cancel.is_cancelled() {
                self.end(SessionState::Cancelled);
                continue;
            }

            match self.pull_raw() {
                Ok(Some(raw)) => {
                    let template = self.options.assembler.template();
                    if template.is_stop_fragment(&raw) {
                        self.stop_pending = true;
                    }
                    let cleaned = template.clean_fragment(&raw);
                    let fragment = if self.reply.is_empty() {
                        cleaned.trim_start().to_string()
                    } else {
                        cleaned
                    };
                    if !fragment.is_empty() {
                        self.reply.push_text(&fragment);
                        self.fragments += 1;
                        return Some(fragment);
                    }
                }
                Ok(None) => self.end(SessionState::Completed),
                Err(error) => {
                    warn!(
                        %error,
                        fragments = self.fragments,
                        tokens = self.tokens_generated,
                        "generation failed, ending turn"
                    );
                    self.end(SessionState::Failed);
                }
            }
        }
    }
}

impl Drop for StreamingSession<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedEngine;
    use assert_matches::assert_matches;
    use phi_context::BudgetConfig;
    use phi_core::logging::capture_logs;
    use tracing::Level;

    fn history() -> ConversationHistory {
        ConversationHistory::new("Begin.", BudgetConfig::default())
    }

    fn run(engine: &ScriptedEngine, history: &mut ConversationHistory, text: &str) -> (Vec<String>, TurnOutcome) {
        let mut session = StreamingSession::generate(
            engine,
            history,
            text,
            CancellationToken::new(),
            SessionOptions::default(),
        )
        .unwrap();
        let fragments: Vec<String> = session.by_ref().collect();
        (fragments, session.finish())
    }

    #[test]
    fn end_marker_stops_and_is_never_yielded() {
        let engine = ScriptedEngine::new(["Hel", "lo", "<|end|>", "ignored"]);
        let mut history = history();

        let (fragments, outcome) = run(&engine, &mut history, "Hi");

        assert_eq!(fragments, vec!["Hel", "lo"]);
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.committed_text.as_deref(), Some("Hello"));
        assert_eq!(outcome.fragments, 2);
        assert_eq!(engine.steps_taken(), 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history.messages()[2].role(), Role::Assistant);
        assert_eq!(history.messages()[2].text(), "Hello");
    }

    #[test]
    fn text_before_end_marker_is_kept() {
        let engine = ScriptedEngine::new(["Hi", " there.<|end|>", "more"]);
        let mut history = history();
        let (fragments, _) = run(&engine, &mut history, "Hello");
        assert_eq!(fragments, vec!["Hi", " there."]);
        assert_eq!(history.messages()[2].text(), "Hi there.");
    }

    #[test]
    fn first_fragment_leading_whitespace_stripped() {
        let engine = ScriptedEngine::new(["  ", "\n Sure", " thing ", "<|end|>"]);
        let mut history = history();
        let (fragments, _) = run(&engine, &mut history, "Hi");
        assert_eq!(fragments, vec!["Sure", " thing "]);
        assert_eq!(history.messages()[2].text(), "Sure thing ");
    }

    #[test]
    fn role_markers_removed_and_user_marker_stops() {
        let engine = ScriptedEngine::new(["<|assistant|>Yes", "<|user|>", "never"]);
        let mut history = history();
        let (fragments, outcome) = run(&engine, &mut history, "Hi");
        assert_eq!(fragments, vec!["Yes"]);
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(engine.steps_taken(), 2);
    }

    #[test]
    fn generator_exhaustion_completes() {
        let engine = ScriptedEngine::new(["a", "b"]);
        let mut history = history();
        let (fragments, outcome) = run(&engine, &mut history, "Hi");
        assert_eq!(fragments, vec!["a", "b"]);
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.tokens_generated, 2);
    }

    #[test]
    fn prompt_contains_user_turn() {
        let engine = ScriptedEngine::new(["<|end|>"]);
        let mut history = history();
        let _ = run(&engine, &mut history, "  Hi  ");
        assert_eq!(
            engine.last_prompt().as_deref(),
            Some("<|system|>Begin.<|end|><|user|>Hi<|end|><|assistant|>")
        );
    }

    #[test]
    fn not_ready_leaves_history_untouched() {
        let engine = ScriptedEngine::new(["x"]);
        engine.set_ready(false);
        let mut history = history();

        let result = StreamingSession::generate(
            &engine,
            &mut history,
            "Hi",
            CancellationToken::new(),
            SessionOptions::default(),
        );

        assert_matches!(result.err(), Some(ChatError::NotReady));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn blank_input_is_ignored() {
        let engine = ScriptedEngine::new(["x"]);
        let mut history = history();
        for text in ["", "   ", "\n\t"] {
            let (fragments, outcome) = run(&engine, &mut history, text);
            assert!(fragments.is_empty());
            assert_eq!(outcome.committed_text, None);
        }
        assert_eq!(history.len(), 1);
        assert_eq!(engine.steps_taken(), 0);
    }

    #[test]
    fn pre_cancelled_turn_does_not_touch_history() {
        let engine = ScriptedEngine::new(["x"]);
        let mut history = history();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut session = StreamingSession::generate(
            &engine,
            &mut history,
            "Hi",
            cancel,
            SessionOptions::default(),
        )
        .unwrap();
        assert_eq!(session.next(), None);
        assert_eq!(session.finish().state, SessionState::Cancelled);

        assert_eq!(history.len(), 1);
        assert_eq!(engine.steps_taken(), 0);
    }

    #[test]
    fn cancellation_mid_stream_commits_partial_reply() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let engine = ScriptedEngine::new(["one", " two", " three", "<|end|>"]).with_step_hook(
            move |index| {
                if index == 1 {
                    trigger.cancel();
                }
            },
        );
        let mut history = history();

        let mut session =
            StreamingSession::generate(&engine, &mut history, "Count", cancel, SessionOptions::default())
                .unwrap();
        let fragments: Vec<String> = session.by_ref().collect();
        let outcome = session.finish();

        // the step in flight when cancel fires still completes
        assert_eq!(fragments, vec!["one", " two"]);
        assert_eq!(outcome.state, SessionState::Cancelled);
        assert_eq!(engine.steps_taken(), 2);
        assert_eq!(history.messages().last().unwrap().text(), "one two");
    }

    #[test]
    fn cancel_after_start_before_first_fragment_commits_nothing() {
        let engine = ScriptedEngine::new(["Hel", "lo", "<|end|>"]);
        let mut history = history();
        let cancel = CancellationToken::new();

        let mut session = StreamingSession::generate(
            &engine,
            &mut history,
            "Hi",
            cancel.clone(),
            SessionOptions::default(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.placeholder().is_empty());

        cancel.cancel();
        assert_eq!(session.next(), None);
        assert_eq!(session.state(), SessionState::Cancelled);
        let outcome = session.finish();
        assert_eq!(outcome.committed_text, None);

        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].role(), Role::User);
        assert!(history.messages().iter().all(|m| m.role() != Role::Assistant));
        assert_eq!(engine.steps_taken(), 0);
    }

    #[test]
    fn retracted_fragment_is_not_committed() {
        let engine = ScriptedEngine::new(["a", "b", "c", "<|end|>"]);
        let mut history = history();
        let mut session = StreamingSession::generate(
            &engine,
            &mut history,
            "Go",
            CancellationToken::new(),
            SessionOptions::default(),
        )
        .unwrap();

        assert_eq!(session.next().as_deref(), Some("a"));
        let undelivered = session.next().unwrap();
        assert!(!session.retract("a"));
        assert!(session.retract(&undelivered));
        let outcome = session.finish();

        assert_eq!(outcome.state, SessionState::Cancelled);
        assert_eq!(outcome.fragments, 1);
        assert_eq!(outcome.committed_text.as_deref(), Some("a"));
        assert_eq!(history.messages()[2].text(), "a");
    }

    #[test]
    fn retract_after_commit_is_ignored() {
        let engine = ScriptedEngine::new(["a", "<|end|>"]);
        let mut history = history();
        let mut session = StreamingSession::generate(
            &engine,
            &mut history,
            "Go",
            CancellationToken::new(),
            SessionOptions::default(),
        )
        .unwrap();
        let fragments: Vec<String> = session.by_ref().collect();
        assert_eq!(fragments, vec!["a"]);
        assert!(!session.retract("a"));
        assert_eq!(session.finish().committed_text.as_deref(), Some("a"));
    }

    #[test]
    fn end_of_text_token_stops_and_is_never_yielded() {
        let engine = ScriptedEngine::new(["Hi", "<|endoftext|>", "after"]);
        let mut history = history();

        let (fragments, outcome) = run(&engine, &mut history, "Hello");

        assert_eq!(fragments, vec!["Hi"]);
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.committed_text.as_deref(), Some("Hi"));
        assert_eq!(engine.steps_taken(), 2);
    }

    #[test]
    fn placeholder_tracks_reply() {
        let engine = ScriptedEngine::new(["Hel", "lo"]);
        let mut history = history();
        let mut session = StreamingSession::generate(
            &engine,
            &mut history,
            "Hi",
            CancellationToken::new(),
            SessionOptions::default(),
        )
        .unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.placeholder().is_empty());
        assert_eq!(session.placeholder().role(), Role::Assistant);

        assert_eq!(session.next().as_deref(), Some("Hel"));
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.placeholder().text(), "Hel");
    }

    #[test]
    fn dropping_early_commits_partial_reply() {
        let engine = ScriptedEngine::new(["Hel", "lo", "<|end|>"]);
        let mut history = history();
        {
            let mut session = StreamingSession::generate(
                &engine,
                &mut history,
                "Hi",
                CancellationToken::new(),
                SessionOptions::default(),
            )
            .unwrap();
            assert_eq!(session.next().as_deref(), Some("Hel"));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.messages()[2].text(), "Hel");
    }

    #[test]
    fn step_failure_is_logged_and_swallowed() {
        let (logs, _guard) = capture_logs();
        let engine = ScriptedEngine::new(["Par", "tial", "x"]).failing_step_at(2);
        let mut history = history();

        let (fragments, outcome) = run(&engine, &mut history, "Hi");

        assert_eq!(fragments, vec!["Par", "tial"]);
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(history.messages()[2].text(), "Partial");
        assert!(logs.has_event(Level::WARN, "generation failed"));
    }

    #[test]
    fn encode_failure_commits_nothing() {
        let (logs, _guard) = capture_logs();
        let engine = ScriptedEngine::new(["x"]).failing_encode();
        let mut history = history();

        let (fragments, outcome) = run(&engine, &mut history, "Hi");

        assert!(fragments.is_empty());
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.committed_text, None);
        // user message stays, no empty assistant message is added
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].role(), Role::User);
        assert_eq!(logs.count_at_level(Level::WARN), 1);
    }

    #[test]
    fn decode_failure_ends_turn() {
        let engine = ScriptedEngine::new(["ok", "bad"]).failing_decode_at(1);
        let mut history = history();
        let (fragments, outcome) = run(&engine, &mut history, "Hi");
        assert_eq!(fragments, vec!["ok"]);
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.committed_text.as_deref(), Some("ok"));
    }

    #[test]
    fn committed_text_equals_concatenated_fragments() {
        let engine = ScriptedEngine::new([" A", "b ", "", " c\n", "<|end|>"]);
        let mut history = history();
        let (fragments, outcome) = run(&engine, &mut history, "Hi");
        assert_eq!(outcome.committed_text, Some(fragments.concat()));
    }

    #[test]
    fn reply_eviction_applies_on_commit() {
        let engine = ScriptedEngine::new(["a long enough reply", "<|end|>"]);
        let mut history = ConversationHistory::new(
            "Sys",
            BudgetConfig {
                max_context_tokens: 4,
                average_chars_per_token: 4,
            },
        );
        let _ = run(&engine, &mut history, "Hi");
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].role(), Role::Assistant);
        assert!(history.total_tokens() > history.max_context_tokens());
    }
}
