//! Chat template markers and fragment cleaning.

use phi_core::Role;
use phi_settings::TemplateSettings;

/// Role and end markers of the model's chat format.
///
/// The same markers frame the prompt and are stripped from decoded output,
/// so both directions are defined here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatTemplate {
    system_token: String,
    user_token: String,
    assistant_token: String,
    end_token: String,
    stop_tokens: Vec<String>,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::from_settings(&TemplateSettings::default())
    }
}

impl ChatTemplate {
    /// Build from loaded settings.
    pub fn from_settings(settings: &TemplateSettings) -> Self {
        Self {
            system_token: settings.system_token.clone(),
            user_token: settings.user_token.clone(),
            assistant_token: settings.assistant_token.clone(),
            end_token: settings.end_token.clone(),
            stop_tokens: settings
                .stop_tokens
                .iter()
                .filter(|token| !token.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Marker that opens a message of `role`.
    pub fn role_token(&self, role: Role) -> &str {
        match role {
            Role::System => &self.system_token,
            Role::User => &self.user_token,
            Role::Assistant => &self.assistant_token,
        }
    }

    /// Marker that closes every message.
    pub fn end_token(&self) -> &str {
        &self.end_token
    }

    /// Control tokens besides the end marker that finish a reply.
    pub fn stop_tokens(&self) -> &[String] {
        &self.stop_tokens
    }

    fn terminators(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.end_token.as_str())
            .chain(self.stop_tokens.iter().map(String::as_str))
            .filter(|token| !token.is_empty())
    }

    /// Strip template markers from a raw decoded fragment.
    ///
    /// Role markers are removed wherever they occur, then everything from the
    /// first end marker or stop token onward is dropped.
    pub fn clean_fragment(&self, raw: &str) -> String {
        let mut text = raw.to_string();
        for token in [&self.system_token, &self.user_token, &self.assistant_token] {
            if !token.is_empty() && text.contains(token.as_str()) {
                text = text.replace(token.as_str(), "");
            }
        }
        let end = self.terminators().filter_map(|token| text.find(token)).min();
        if let Some(end) = end {
            text.truncate(end);
        }
        text
    }

    /// Whether a raw fragment means the model has finished its turn.
    ///
    /// An end marker or stop token, or the model starting a new user or
    /// system message.
    pub fn is_stop_fragment(&self, raw: &str) -> bool {
        self.terminators()
            .chain([self.user_token.as_str(), self.system_token.as_str()])
            .any(|token| !token.is_empty() && raw.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_tokens() {
        let template = ChatTemplate::default();
        assert_eq!(template.role_token(Role::System), "<|system|>");
        assert_eq!(template.role_token(Role::User), "<|user|>");
        assert_eq!(template.role_token(Role::Assistant), "<|assistant|>");
        assert_eq!(template.end_token(), "<|end|>");
    }

    #[test]
    fn clean_passes_plain_text() {
        assert_eq!(ChatTemplate::default().clean_fragment(" world"), " world");
    }

    #[test]
    fn clean_removes_role_markers() {
        let template = ChatTemplate::default();
        assert_eq!(template.clean_fragment("<|assistant|>Sure"), "Sure");
        assert_eq!(template.clean_fragment("a<|user|>b<|system|>c"), "abc");
    }

    #[test]
    fn clean_truncates_at_end_marker() {
        let template = ChatTemplate::default();
        assert_eq!(template.clean_fragment("<|end|>"), "");
        assert_eq!(template.clean_fragment("done.<|end|>trailing"), "done.");
        assert_eq!(template.clean_fragment("x<|end|>y<|end|>"), "x");
    }

    #[test]
    fn stop_detection() {
        let template = ChatTemplate::default();
        assert!(template.is_stop_fragment("<|end|>"));
        assert!(template.is_stop_fragment("ok<|user|>"));
        assert!(template.is_stop_fragment("<|system|>"));
        assert!(!template.is_stop_fragment("<|assistant|>"));
        assert!(!template.is_stop_fragment("Hello"));
    }

    #[test]
    fn end_of_text_token_stops_and_is_stripped() {
        let template = ChatTemplate::default();
        assert_eq!(template.stop_tokens(), ["<|endoftext|>".to_string()]);
        assert!(template.is_stop_fragment("<|endoftext|>"));
        assert_eq!(template.clean_fragment("<|endoftext|>"), "");
        assert_eq!(template.clean_fragment("bye<|endoftext|><|end|>"), "bye");
        assert_eq!(template.clean_fragment("a<|end|>b<|endoftext|>"), "a");
    }

    #[test]
    fn custom_markers() {
        let template = ChatTemplate::from_settings(&TemplateSettings {
            end_token: "</s>".to_string(),
            stop_tokens: Vec::new(),
            ..TemplateSettings::default()
        });
        assert!(template.is_stop_fragment("bye</s>"));
        assert!(!template.is_stop_fragment("<|end|>"));
        assert!(!template.is_stop_fragment("<|endoftext|>"));
        assert_eq!(template.clean_fragment("bye</s>"), "bye");
    }
}
