pub mod agent;
pub mod glob;
pub mod ls;
pub mod todo_write;
pub mod view;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use helm_store::Database;

use crate::registry::ToolRegistry;

/// Registry with every built-in tool except `agent`, which needs the run
/// controller and is added by the coordinator.
pub fn create_default_registry(db: Database) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Search
    registry.register(Arc::new(glob::GlobTool));
    registry.register(Arc::new(ls::LsTool));

    // File operations
    registry.register(Arc::new(view::ViewTool));

    // Task management
    registry.register(Arc::new(todo_write::TodoWriteTool::new(db)));

    registry
}

/// Resolve `path` against the working directory unless it is absolute.
pub(crate) fn resolve_path(path: Option<&str>, working_dir: &Path) -> PathBuf {
    match path {
        Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(p) => working_dir.join(p),
        None => working_dir.to_path_buf(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use helm_core::ids::{MessageId, SessionId, ToolCallId};
    use helm_core::tools::ToolContext;
    use tokio_util::sync::CancellationToken;

    pub fn ctx(dir: &Path) -> ToolContext {
        ctx_for(SessionId::new(), dir)
    }

    pub fn ctx_for(session_id: SessionId, dir: &Path) -> ToolContext {
        ToolContext {
            session_id,
            message_id: Some(MessageId::new()),
            tool_call_id: ToolCallId::new(),
            working_directory: dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("helm_{label}_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins_without_agent() {
        let registry = create_default_registry(Database::in_memory().unwrap());
        assert_eq!(registry.names(), vec!["glob", "ls", "todo_write", "view"]);
        assert!(!registry.contains(helm_core::tool_params::AGENT));
    }

    #[test]
    fn relative_paths_join_working_dir() {
        let wd = Path::new("/work");
        assert_eq!(resolve_path(None, wd), PathBuf::from("/work"));
        assert_eq!(resolve_path(Some("src"), wd), PathBuf::from("/work/src"));
        assert_eq!(resolve_path(Some("/etc"), wd), PathBuf::from("/etc"));
    }
}
