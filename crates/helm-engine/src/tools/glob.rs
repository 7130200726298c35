use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;

use helm_core::tool_params::{self, ToolInput};
use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolOutput};

use super::resolve_path;

const MAX_MATCHES: usize = 1000;

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        tool_params::GLOB
    }

    fn description(&self) -> String {
        "Find files matching a glob pattern".into()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern (e.g. '**/*.rs', 'src/**/*.ts')"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (defaults to working directory)"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let ToolInput::Glob(params) = input else {
            return Err(ToolError::InvalidArguments("glob: unexpected input".into()));
        };

        let base_dir = resolve_path(params.path.as_deref(), &ctx.working_directory);
        let pattern = base_dir.join(&params.pattern).to_string_lossy().to_string();

        // Directory walks block; keep them off the runtime threads.
        let mut matches = tokio::task::spawn_blocking(move || glob_match(&pattern))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("glob task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolOutput::text("No files matched the pattern.", start.elapsed()));
        }

        matches.sort();
        let total = matches.len();
        let mut output = matches
            .iter()
            .take(MAX_MATCHES)
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_MATCHES {
            output.push_str(&format!("\n... {} more", total - MAX_MATCHES));
        }

        Ok(ToolOutput::text(
            format!("{total} file(s) matched:\n{output}"),
            start.elapsed(),
        ))
    }
}

fn glob_match(pattern: &str) -> Result<Vec<PathBuf>, ToolError> {
    let entries = glob::glob(pattern)
        .map_err(|e| ToolError::InvalidArguments(format!("bad glob pattern: {e}")))?;
    Ok(entries.flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::tools::testing::{ctx, temp_dir};
    use helm_core::tool_params::GlobParams;

    fn input(pattern: &str) -> ToolInput {
        ToolInput::Glob(GlobParams {
            pattern: pattern.into(),
            path: None,
        })
    }

    #[tokio::test]
    async fn glob_finds_files() {
        let dir = temp_dir("glob");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.join("src/lib.rs"), "pub mod foo;").unwrap();
        fs::write(dir.join("README.md"), "# README").unwrap();

        let result = GlobTool.execute(input("src/*.rs"), &ctx(&dir)).await.unwrap();

        assert!(!result.is_error);
        assert!(result.content.contains("2 file(s) matched"));
        assert!(result.content.contains("main.rs"));
        assert!(!result.content.contains("README"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_recursive_in_subpath() {
        let dir = temp_dir("glob");
        fs::create_dir_all(dir.join("a/b")).unwrap();
        fs::write(dir.join("a/one.txt"), "1").unwrap();
        fs::write(dir.join("a/b/two.txt"), "2").unwrap();
        fs::write(dir.join("top.txt"), "0").unwrap();

        let params = ToolInput::Glob(GlobParams {
            pattern: "**/*.txt".into(),
            path: Some("a".into()),
        });
        let result = GlobTool.execute(params, &ctx(&dir)).await.unwrap();
        assert!(result.content.contains("2 file(s) matched"));

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn glob_no_matches() {
        let dir = temp_dir("glob");
        let result = GlobTool.execute(input("*.xyz"), &ctx(&dir)).await.unwrap();
        assert!(!result.is_error);
        assert!(result.content.contains("No files matched"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn invalid_pattern_is_an_error() {
        let dir = temp_dir("glob");
        let err = GlobTool.execute(input("[abc"), &ctx(&dir)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        fs::remove_dir_all(&dir).ok();
    }
}
