use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{MessageId, SessionId, ToolCallId};
use crate::tool_params::ToolInput;

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run alongside other calls in the same turn.
    Concurrent,
    /// Runs alone, after the concurrent batch.
    Sequential,
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    /// Assistant message that issued the call.
    pub message_id: Option<MessageId>,
    pub tool_call_id: ToolCallId,
    pub working_directory: PathBuf,
    pub cancel: CancellationToken,
}

/// What a tool returns on completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            duration,
        }
    }

    pub fn error(content: impl Into<String>, duration: Duration) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            duration,
        }
    }
}

/// What the permission gate is shown for a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionTarget {
    pub path: Option<String>,
    pub description: String,
}

/// Tool definition sent to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// May change over the tool's lifetime.
    fn description(&self) -> String;
    fn parameters_schema(&self) -> serde_json::Value;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// Replaces the orchestrator's per-call timeout for this tool.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn permission_target(&self, input: &ToolInput) -> PermissionTarget {
        PermissionTarget {
            path: input.path().map(str::to_string),
            description: format!("run {}", self.name()),
        }
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    /// Infrastructure failure that must abort the run instead of becoming
    /// an error result.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_serde() {
        let json = serde_json::to_string(&ExecutionMode::Concurrent).unwrap();
        assert_eq!(json, r#""concurrent""#);
        let json = serde_json::to_string(&ExecutionMode::Sequential).unwrap();
        assert_eq!(json, r#""sequential""#);
    }

    #[test]
    fn tool_output_duration_serializes_as_ms() {
        let out = ToolOutput::text("ok", Duration::from_millis(1234));
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["duration"], 1234);
        let parsed: ToolOutput = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(1234));
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("missing path".into());
        assert_eq!(err.to_string(), "invalid arguments: missing path");
        assert!(ToolError::Timeout(Duration::from_secs(60)).to_string().contains("60"));
        assert!(ToolError::Fatal("db gone".into()).is_fatal());
        assert!(!ToolError::Cancelled.is_fatal());
    }
}
