//! Permission gate consulted before every tool execution.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use helm_core::ids::{SessionId, ToolCallId};

#[derive(Clone, Debug)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub path: Option<String>,
    pub description: String,
    pub params: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("permission service unavailable")]
    Unavailable,
    #[error("permission request failed: {0}")]
    Failed(String),
}

/// Decides whether a tool call may run. Approval modes and prompting are the
/// implementation's concern; callers only see the answer.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request(&self, request: &PermissionRequest) -> Result<bool, PermissionError>;
}

/// Approves everything.
pub struct AutoApprove;

#[async_trait]
impl PermissionGate for AutoApprove {
    async fn request(&self, request: &PermissionRequest) -> Result<bool, PermissionError> {
        debug!(tool = %request.tool_name, "auto-approved");
        Ok(true)
    }
}

/// Denies everything.
pub struct DenyAll;

#[async_trait]
impl PermissionGate for DenyAll {
    async fn request(&self, _request: &PermissionRequest) -> Result<bool, PermissionError> {
        Ok(false)
    }
}

/// Approves only the named tools.
pub struct AllowTools {
    allowed: HashSet<String>,
}

impl AllowTools {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PermissionGate for AllowTools {
    async fn request(&self, request: &PermissionRequest) -> Result<bool, PermissionError> {
        Ok(self.allowed.contains(&request.tool_name))
    }
}
