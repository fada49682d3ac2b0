//! Prompt assembly.

use phi_core::{ChatError, Message, Result, Role};

use crate::template::ChatTemplate;

/// Renders a transcript into the flat prompt string fed to the engine.
///
/// Layout: the system text framed by the system and end markers, then each
/// later message framed by its role marker and the end marker, then a
/// trailing assistant marker left open for the model to complete.
#[derive(Clone, Debug, Default)]
pub struct PromptAssembler {
    template: ChatTemplate,
}

impl PromptAssembler {
    /// Assembler using `template`.
    pub fn new(template: ChatTemplate) -> Self {
        Self { template }
    }

    /// The template used for framing.
    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    /// Build the prompt for `messages`.
    ///
    /// The first `System` message supplies the system text; without one the
    /// system block is rendered empty. Fails with
    /// [`ChatError::InvalidState`] when `messages` is empty.
    pub fn build(&self, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(ChatError::invalid_state("cannot build a prompt from an empty history"));
        }

        let system_text = messages
            .iter()
            .find(|m| m.role() == Role::System)
            .map_or("", Message::text);

        let t = &self.template;
        let capacity = messages.iter().map(|m| m.text().len() + 32).sum::<usize>() + 32;
        let mut prompt = String::with_capacity(capacity);

        prompt.push_str(t.role_token(Role::System));
        prompt.push_str(system_text);
        prompt.push_str(t.end_token());

        for message in messages.iter().filter(|m| m.role() != Role::System) {
            prompt.push_str(t.role_token(message.role()));
            prompt.push_str(message.text());
            prompt.push_str(t.end_token());
        }

        prompt.push_str(t.role_token(Role::Assistant));
        Ok(prompt)
    }
}
