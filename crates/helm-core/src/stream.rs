use crate::errors::GatewayError;
use crate::ids::ToolCallId;
use crate::messages::{FinishReason, ToolCall};
use crate::usage::TokenUsage;

/// Events emitted while a provider streams one response. Ordering contract:
///
/// Start → (TextDelta | ReasoningDelta | ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Done
///
/// Error may replace Done at any point.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    ReasoningDelta { delta: String },
    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_call: ToolCall },
    Done { finish_reason: FinishReason, usage: TokenUsage },
    Error { error: GatewayError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn is_content_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ReasoningDelta { .. } | Self::ToolCallDelta { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = StreamEvent::Done {
            finish_reason: FinishReason::EndTurn,
            usage: TokenUsage::default(),
        };
        assert!(done.is_terminal());
        assert!(StreamEvent::Error { error: GatewayError::Cancelled }.is_terminal());

        let delta = StreamEvent::TextDelta { delta: "x".into() };
        assert!(!delta.is_terminal());
        assert!(delta.is_content_delta());
        assert!(!StreamEvent::Start.is_content_delta());
    }
}
