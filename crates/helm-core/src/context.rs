use crate::messages::Message;
use crate::tools::ToolDefinition;

/// Everything a provider needs for one call.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::messages::Role::User)
            .map(|m| m.text_content())
    }
}
