use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};
use crate::models::{ModelType, SelectedModel};
use crate::usage::TokenUsage;

/// Engine events broadcast while runs execute. Persistence events live in
/// the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    RunStart {
        session_id: SessionId,
    },
    TurnStart {
        session_id: SessionId,
        turn: u32,
    },
    TextDelta {
        session_id: SessionId,
        delta: String,
    },
    ReasoningDelta {
        session_id: SessionId,
        delta: String,
    },
    ToolStart {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },
    ToolEnd {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        is_error: bool,
        duration_ms: u64,
    },
    TurnComplete {
        session_id: SessionId,
        turn: u32,
        usage: TokenUsage,
        cost: f64,
    },
    /// A provider reported the context window was exceeded. `strict` is set
    /// when the stricter status-400 check also matched.
    ContextOverflow {
        session_id: SessionId,
        strict: bool,
    },
    SummarizeStart {
        session_id: SessionId,
    },
    SummarizeComplete {
        session_id: SessionId,
        summary_chars: usize,
    },
    ModelSwitched {
        model_type: ModelType,
        model: SelectedModel,
    },
    SubagentStart {
        parent_session_id: SessionId,
        child_session_id: SessionId,
        subagent: String,
    },
    SubagentComplete {
        parent_session_id: SessionId,
        child_session_id: SessionId,
        cost: f64,
        is_error: bool,
    },
    RunEnd {
        session_id: SessionId,
        error: Option<String>,
    },
}

impl AgentEvent {
    /// Session the event concerns. Model switches are global.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::RunStart { session_id }
            | Self::TurnStart { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::ContextOverflow { session_id, .. }
            | Self::SummarizeStart { session_id }
            | Self::SummarizeComplete { session_id, .. }
            | Self::RunEnd { session_id, .. } => Some(session_id),
            Self::SubagentStart { parent_session_id, .. }
            | Self::SubagentComplete { parent_session_id, .. } => Some(parent_session_id),
            Self::ModelSwitched { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::TurnStart { .. } => "turn_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::TurnComplete { .. } => "turn_complete",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::SummarizeStart { .. } => "summarize_start",
            Self::SummarizeComplete { .. } => "summarize_complete",
            Self::ModelSwitched { .. } => "model_switched",
            Self::SubagentStart { .. } => "subagent_start",
            Self::SubagentComplete { .. } => "subagent_complete",
            Self::RunEnd { .. } => "run_end",
        }
    }
}
