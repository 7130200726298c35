use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use helm_core::tools::{Tool, ToolDefinition};

/// Filter for selecting tools when creating sub-agent registries.
#[derive(Clone, Debug)]
pub enum ToolFilter {
    /// Same tools as parent.
    InheritAll,
    /// Parent tools minus these.
    InheritExcept(HashSet<String>),
    /// Only these tools.
    Explicit(HashSet<String>),
}

impl ToolFilter {
    /// Build a filter from an optional allow-list and a deny-list.
    pub fn from_lists(allow: Option<&[String]>, deny: &[String]) -> Self {
        match allow {
            Some(names) => Self::Explicit(
                names
                    .iter()
                    .filter(|n| !deny.contains(n))
                    .cloned()
                    .collect(),
            ),
            None if deny.is_empty() => Self::InheritAll,
            None => Self::InheritExcept(deny.iter().cloned().collect()),
        }
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::InheritExcept(excluded) => !excluded.contains(name),
            Self::Explicit(included) => included.contains(name),
        }
    }
}

/// Registry of available tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Create a filtered copy for a sub-agent.
    pub fn clone_for_subagent(&self, filter: &ToolFilter) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| filter.includes(name))
                .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
                .collect(),
        }
    }
}
