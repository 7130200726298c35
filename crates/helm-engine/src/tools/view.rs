use std::time::Instant;

use async_trait::async_trait;

use helm_core::tool_params::{self, ToolInput};
use helm_core::tools::{ExecutionMode, PermissionTarget, Tool, ToolContext, ToolError, ToolOutput};

use super::resolve_path;

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

pub struct ViewTool;

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        tool_params::VIEW
    }

    fn description(&self) -> String {
        "Read a file with line numbers. Use offset and limit for large files.".into()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (default: 2000)"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    fn permission_target(&self, input: &ToolInput) -> PermissionTarget {
        let path = input.path().map(str::to_string);
        PermissionTarget {
            description: format!("read {}", path.as_deref().unwrap_or("file")),
            path,
        }
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let ToolInput::View(params) = input else {
            return Err(ToolError::InvalidArguments("view: unexpected input".into()));
        };

        let path = resolve_path(Some(&params.file_path), &ctx.working_directory);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolOutput::error(
                    format!("failed to read {}: {e}", path.display()),
                    start.elapsed(),
                ))
            }
        };

        let offset = params.offset.unwrap_or(1).max(1);
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

        let lines: Vec<&str> = content.lines().collect();
        let start_idx = (offset - 1).min(lines.len());
        let end_idx = start_idx.saturating_add(limit).min(lines.len());

        let mut output = String::new();
        for (i, line) in lines[start_idx..end_idx].iter().enumerate() {
            let shown = match line.char_indices().nth(MAX_LINE_CHARS) {
                Some((cut, _)) => &line[..cut],
                None => line,
            };
            output.push_str(&format!("{:>6}\t{}\n", start_idx + i + 1, shown));
        }
        if end_idx < lines.len() {
            output.push_str(&format!("... {} more line(s)\n", lines.len() - end_idx));
        }
        if output.is_empty() {
            output = "(empty file)".to_string();
        }

        Ok(ToolOutput::text(output, start.elapsed()))
    }
}
