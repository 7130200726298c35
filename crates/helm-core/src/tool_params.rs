//! Typed parameters for the built-in tools.
//!
//! The orchestrator decodes a call's raw JSON once, keyed by tool name, and
//! hands the tool a [`ToolInput`]. Tools outside the built-in set receive the
//! JSON untouched as [`ToolInput::Raw`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tools::ToolError;

pub const GLOB: &str = "glob";
pub const LS: &str = "ls";
pub const VIEW: &str = "view";
pub const TODO_WRITE: &str = "todo_write";
pub const AGENT: &str = "agent";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobParams {
    pub pattern: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LsParams {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub depth: Option<usize>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    pub file_path: String,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoWriteParams {
    pub todos: Vec<Todo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentParams {
    pub prompt: String,
    #[serde(default)]
    pub subagent: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolInput {
    Glob(GlobParams),
    Ls(LsParams),
    View(ViewParams),
    TodoWrite(TodoWriteParams),
    Agent(AgentParams),
    Raw(serde_json::Value),
}

fn typed<T: DeserializeOwned>(tool: &str, value: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(value)
        .map_err(|e| ToolError::InvalidArguments(format!("{tool}: {e}")))
}

impl ToolInput {
    /// Decode `value` for the tool called `name`.
    pub fn parse(name: &str, value: serde_json::Value) -> Result<Self, ToolError> {
        // Models sometimes send `null` for an empty argument object.
        let value = if value.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            value
        };
        Ok(match name {
            GLOB => Self::Glob(typed(name, value)?),
            LS => Self::Ls(typed(name, value)?),
            VIEW => Self::View(typed(name, value)?),
            TODO_WRITE => Self::TodoWrite(typed(name, value)?),
            AGENT => {
                let params: AgentParams = typed(name, value)?;
                if params.prompt.trim().is_empty() {
                    return Err(ToolError::InvalidArguments("agent: prompt is required".into()));
                }
                Self::Agent(params)
            }
            _ => Self::Raw(value),
        })
    }

    /// Filesystem path the call targets, when it has one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Glob(p) => p.path.as_deref(),
            Self::Ls(p) => p.path.as_deref(),
            Self::View(p) => Some(&p.file_path),
            Self::Raw(v) => v
                .get("path")
                .or_else(|| v.get("file_path"))
                .and_then(|p| p.as_str()),
            Self::TodoWrite(_) | Self::Agent(_) => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            Self::Glob(p) => serde_json::to_value(p),
            Self::Ls(p) => serde_json::to_value(p),
            Self::View(p) => serde_json::to_value(p),
            Self::TodoWrite(p) => serde_json::to_value(p),
            Self::Agent(p) => serde_json::to_value(p),
            Self::Raw(v) => Ok(v.clone()),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }
}
