use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;

use helm_core::tool_params::{self, ToolInput};
use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolOutput};

use super::resolve_path;

const MAX_ENTRIES: usize = 1000;
const DEFAULT_DEPTH: usize = 2;
const MAX_DEPTH: usize = 10;

const SKIP_DIRS: &[&str] = &[
    "node_modules", "target", "dist", "build", "__pycache__", "vendor",
];

pub struct LsTool;

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        tool_params::LS
    }

    fn description(&self) -> String {
        "List a directory as a tree. Hidden entries and build output are skipped.".into()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to working directory)"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum depth (default: 2)"
                },
                "ignore": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns of entry names to skip"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let ToolInput::Ls(params) = input else {
            return Err(ToolError::InvalidArguments("ls: unexpected input".into()));
        };

        let dir = resolve_path(params.path.as_deref(), &ctx.working_directory);
        if !dir.is_dir() {
            return Ok(ToolOutput::error(
                format!("not a directory: {}", dir.display()),
                start.elapsed(),
            ));
        }
        let depth = params.depth.unwrap_or(DEFAULT_DEPTH).clamp(1, MAX_DEPTH);
        let ignore = params
            .ignore
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ToolError::InvalidArguments(format!("bad ignore pattern: {e}")))?;

        let output = tokio::task::spawn_blocking(move || build_tree(&dir, depth, &ignore))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("ls task failed: {e}")))?;

        Ok(ToolOutput::text(output, start.elapsed()))
    }
}

fn build_tree(root: &Path, max_depth: usize, ignore: &[glob::Pattern]) -> String {
    let mut lines = vec![format!("{}/", root.display())];
    let mut count = 0;
    walk(root, "", 0, max_depth, ignore, &mut lines, &mut count);
    if count >= MAX_ENTRIES {
        lines.push(format!("... truncated at {MAX_ENTRIES} entries"));
    }
    lines.join("\n")
}

fn walk(
    dir: &Path,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    ignore: &[glob::Pattern],
    lines: &mut Vec<String>,
    count: &mut usize,
) {
    if depth >= max_depth || *count >= MAX_ENTRIES {
        return;
    }
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };

    let mut entries: Vec<_> = read
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            let is_dir = e.path().is_dir();
            !name.starts_with('.')
                && !(is_dir && SKIP_DIRS.contains(&name.as_ref()))
                && !ignore.iter().any(|p| p.matches(&name))
        })
        .collect();

    entries.sort_by(|a, b| {
        let (a_dir, b_dir) = (a.path().is_dir(), b.path().is_dir());
        b_dir.cmp(&a_dir).then_with(|| a.file_name().cmp(&b.file_name()))
    });

    let total = entries.len();
    for (i, entry) in entries.iter().enumerate() {
        if *count >= MAX_ENTRIES {
            break;
        }
        *count += 1;

        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let last = i + 1 == total;
        let connector = if last { "└── " } else { "├── " };

        if path.is_dir() {
            lines.push(format!("{prefix}{connector}{name}/"));
            let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
            walk(&path, &child_prefix, depth + 1, max_depth, ignore, lines, count);
        } else {
            lines.push(format!("{prefix}{connector}{name}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::tools::testing::{ctx, temp_dir};
    use helm_core::tool_params::LsParams;

    fn fixture() -> std::path::PathBuf {
        let dir = temp_dir("ls");
        fs::create_dir_all(dir.join("src/deep/deeper")).unwrap();
        fs::create_dir_all(dir.join(".git")).unwrap();
        fs::create_dir_all(dir.join("target")).unwrap();
        fs::write(dir.join("src/main.rs"), "").unwrap();
        fs::write(dir.join("src/deep/deeper/x.rs"), "").unwrap();
        fs::write(dir.join("Cargo.toml"), "").unwrap();
        fs::write(dir.join("notes.log"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn lists_tree_dirs_first() {
        let dir = fixture();
        let out = LsTool
            .execute(ToolInput::Ls(LsParams::default()), &ctx(&dir))
            .await
            .unwrap();
        assert!(!out.is_error);
        let src = out.content.find("src/").unwrap();
        let cargo = out.content.find("Cargo.toml").unwrap();
        assert!(src < cargo);
        assert!(out.content.contains("main.rs"));
        assert!(out.content.contains("deep/"));
        // Default depth stops before the third level.
        assert!(!out.content.contains("deeper"));
        assert!(!out.content.contains(".git"));
        assert!(!out.content.contains("target"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn ignore_patterns_and_depth() {
        let dir = fixture();
        let params = LsParams {
            path: None,
            depth: Some(4),
            ignore: vec!["*.log".into()],
        };
        let out = LsTool.execute(ToolInput::Ls(params), &ctx(&dir)).await.unwrap();
        assert!(out.content.contains("x.rs"));
        assert!(!out.content.contains("notes.log"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_directory_is_error_output() {
        let dir = temp_dir("ls");
        let params = LsParams {
            path: Some("nope".into()),
            ..Default::default()
        };
        let out = LsTool.execute(ToolInput::Ls(params), &ctx(&dir)).await.unwrap();
        assert!(out.is_error);
        fs::remove_dir_all(&dir).ok();
    }
}
