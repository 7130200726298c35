use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use helm_core::tool_params::{self, TodoStatus, ToolInput};
use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolOutput};
use helm_store::{Database, SessionRepo};

/// Replaces the session's todo list. The list is stored on the session so
/// summarization can carry it forward.
pub struct TodoWriteTool {
    sessions: SessionRepo,
}

impl TodoWriteTool {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db),
        }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        tool_params::TODO_WRITE
    }

    fn description(&self) -> String {
        "Create and manage a task list for the current session. Send the full list each time."
            .into()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["content", "status"]
                    },
                    "description": "The full task list to write"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let ToolInput::TodoWrite(params) = input else {
            return Err(ToolError::InvalidArguments("todo_write: unexpected input".into()));
        };

        let in_progress = params
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Ok(ToolOutput::error(
                "only one todo may be in_progress at a time",
                start.elapsed(),
            ));
        }

        let mut session = self
            .sessions
            .get(&ctx.session_id)
            .map_err(|e| ToolError::ExecutionFailed(format!("load session: {e}")))?;
        session.todos = params.todos;
        self.sessions
            .save(&session)
            .map_err(|e| ToolError::ExecutionFailed(format!("save todos: {e}")))?;

        let done = session
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        debug!(session_id = %ctx.session_id, total = session.todos.len(), done, "todos updated");

        let mut out = format!("Updated {} todo(s), {done} completed.\n", session.todos.len());
        for todo in &session.todos {
            let mark = match todo.status {
                TodoStatus::Completed => "[x]",
                TodoStatus::InProgress => "[~]",
                TodoStatus::Pending => "[ ]",
            };
            out.push_str(&format!("{mark} {}\n", todo.content));
        }
        Ok(ToolOutput::text(out, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::ids::SessionId;
    use helm_core::tool_params::{Todo, TodoWriteParams};

    use crate::tools::testing::ctx_for;

    fn todo(content: &str, status: TodoStatus) -> Todo {
        Todo {
            content: content.into(),
            status,
        }
    }

    #[tokio::test]
    async fn writes_todos_to_session() {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("t", "/tmp").unwrap();
        let tool = TodoWriteTool::new(db.clone());

        let input = ToolInput::TodoWrite(TodoWriteParams {
            todos: vec![
                todo("read code", TodoStatus::Completed),
                todo("write fix", TodoStatus::InProgress),
            ],
        });
        let out = tool
            .execute(input, &ctx_for(session.id.clone(), std::path::Path::new("/tmp")))
            .await
            .unwrap();
        assert!(out.content.contains("1 completed"));
        assert!(out.content.contains("[~] write fix"));

        let stored = SessionRepo::new(db).get(&session.id).unwrap();
        assert_eq!(stored.todos.len(), 2);
        assert_eq!(stored.todos[1].status, TodoStatus::InProgress);
    }

    #[tokio::test]
    async fn two_in_progress_is_rejected() {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create("t", "/tmp").unwrap();
        let input = ToolInput::TodoWrite(TodoWriteParams {
            todos: vec![
                todo("a", TodoStatus::InProgress),
                todo("b", TodoStatus::InProgress),
            ],
        });
        let out = TodoWriteTool::new(db)
            .execute(input, &ctx_for(session.id, std::path::Path::new("/tmp")))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn unknown_session_fails_execution() {
        let db = Database::in_memory().unwrap();
        let input = ToolInput::TodoWrite(TodoWriteParams { todos: vec![] });
        let err = TodoWriteTool::new(db)
            .execute(input, &ctx_for(SessionId::new(), std::path::Path::new("/tmp")))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }
}
