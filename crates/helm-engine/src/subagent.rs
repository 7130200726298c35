//! Named sub-agent definitions and the registry the "agent" tool reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use helm_core::models::SelectedModel;
use helm_settings::SubagentSettings;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A named, independently configured nested agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Subagent {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Falls back to the task-agent model when unset.
    pub model: Option<SelectedModel>,
    pub temperature: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    /// Allow-list of tool names. `None` inherits every parent tool.
    pub tools: Option<Vec<String>>,
    pub exclude_tools: Vec<String>,
    pub max_turns: Option<u32>,
}

impl From<SubagentSettings> for Subagent {
    fn from(s: SubagentSettings) -> Self {
        Self {
            name: s.name,
            description: s.description,
            system_prompt: s.system_prompt,
            model: s.model,
            temperature: s.temperature,
            frequency_penalty: s.frequency_penalty,
            presence_penalty: s.presence_penalty,
            tools: s.tools,
            exclude_tools: s.exclude_tools,
            max_turns: s.max_turns,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(String),
    Updated(String),
    Removed(String),
}

impl RegistryEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Added(n) | Self::Updated(n) | Self::Removed(n) => n,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no subagent registry configured")]
    NotConfigured,
    #[error("unknown subagent: {0}")]
    Unknown(String),
    #[error("invalid subagent definition: {0}")]
    Invalid(String),
    #[error("failed to load subagents: {0}")]
    Load(String),
}

/// Read side of sub-agent discovery plus change notification.
pub trait SubagentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<Subagent>>;
    /// All definitions, sorted by name.
    fn list(&self) -> Vec<Arc<Subagent>>;
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
    /// Re-read definitions from the backing source.
    fn reload(&self) -> Result<(), RegistryError>;
}

pub type SubagentLoader = Box<dyn Fn() -> Result<Vec<Subagent>, RegistryError> + Send + Sync>;

/// Registry held in memory, optionally refreshed from a loader.
pub struct InMemorySubagentRegistry {
    agents: RwLock<BTreeMap<String, Arc<Subagent>>>,
    loader: Option<SubagentLoader>,
    events: broadcast::Sender<RegistryEvent>,
}

impl InMemorySubagentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agents: RwLock::new(BTreeMap::new()),
            loader: None,
            events,
        }
    }

    /// Registry seeded from `agents`. Invalid definitions are rejected.
    pub fn with_agents(agents: Vec<Subagent>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.replace_all(agents)?;
        Ok(registry)
    }

    /// Registry backed by `loader`, loaded once immediately.
    pub fn with_loader(loader: SubagentLoader) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.loader = Some(loader);
        registry.reload()?;
        Ok(registry)
    }

    /// Add or replace one definition.
    pub fn upsert(&self, agent: Subagent) -> Result<(), RegistryError> {
        validate(&agent)?;
        let name = agent.name.clone();
        let previous = self.agents.write().insert(name.clone(), Arc::new(agent.clone()));
        match previous {
            None => self.publish(RegistryEvent::Added(name)),
            Some(old) if *old != agent => self.publish(RegistryEvent::Updated(name)),
            Some(_) => {}
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.agents.write().remove(name).is_some();
        if removed {
            self.publish(RegistryEvent::Removed(name.to_string()));
        }
        removed
    }

    /// Swap in a full set of definitions, publishing the differences.
    fn replace_all(&self, agents: Vec<Subagent>) -> Result<(), RegistryError> {
        let mut next = BTreeMap::new();
        for agent in agents {
            validate(&agent)?;
            if next.contains_key(&agent.name) {
                return Err(RegistryError::Invalid(format!(
                    "duplicate subagent '{}'",
                    agent.name
                )));
            }
            next.insert(agent.name.clone(), Arc::new(agent));
        }

        let mut changes = Vec::new();
        {
            let mut current = self.agents.write();
            for (name, agent) in &next {
                match current.get(name) {
                    None => changes.push(RegistryEvent::Added(name.clone())),
                    Some(old) if old != agent => changes.push(RegistryEvent::Updated(name.clone())),
                    Some(_) => {}
                }
            }
            for name in current.keys() {
                if !next.contains_key(name) {
                    changes.push(RegistryEvent::Removed(name.clone()));
                }
            }
            *current = next;
        }

        for change in changes {
            self.publish(change);
        }
        Ok(())
    }

    fn publish(&self, event: RegistryEvent) {
        debug!(subagent = %event.name(), event = ?event, "subagent registry changed");
        if self.events.send(event).is_err() {
            debug!("registry event dropped: no subscribers");
        }
    }
}

impl Default for InMemorySubagentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubagentRegistry for InMemorySubagentRegistry {
    fn get(&self, name: &str) -> Option<Arc<Subagent>> {
        self.agents.read().get(name).cloned()
    }

    fn list(&self) -> Vec<Arc<Subagent>> {
        self.agents.read().values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn reload(&self) -> Result<(), RegistryError> {
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        let agents = loader()?;
        let count = agents.len();
        self.replace_all(agents)?;
        info!(count, "subagents reloaded");
        Ok(())
    }
}

fn validate(agent: &Subagent) -> Result<(), RegistryError> {
    if agent.name.trim().is_empty() {
        return Err(RegistryError::Invalid("empty name".into()));
    }
    if agent.max_turns == Some(0) {
        return Err(RegistryError::Invalid(format!(
            "subagent '{}' has max_turns 0",
            agent.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn agent(name: &str, description: &str) -> Subagent {
        Subagent {
            name: name.into(),
            description: description.into(),
            system_prompt: format!("You are {name}."),
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn upsert_and_remove_publish_events() {
        let reg = InMemorySubagentRegistry::new();
        let mut rx = reg.subscribe();
        reg.upsert(agent("reviewer", "reviews code")).unwrap();
        reg.upsert(agent("reviewer", "reviews code")).unwrap();
        reg.upsert(agent("reviewer", "reviews diffs")).unwrap();
        assert!(reg.remove("reviewer"));
        assert!(!reg.remove("reviewer"));
        assert_eq!(
            drain(&mut rx),
            vec![
                RegistryEvent::Added("reviewer".into()),
                RegistryEvent::Updated("reviewer".into()),
                RegistryEvent::Removed("reviewer".into()),
            ]
        );
    }

    #[test]
    fn list_is_sorted() {
        let reg =
            InMemorySubagentRegistry::with_agents(vec![agent("b", ""), agent("a", "")]).unwrap();
        let names: Vec<_> = reg.list().iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(reg.get("a").is_some());
        assert!(reg.get("zzz").is_none());
    }

    #[test]
    fn rejects_invalid_definitions() {
        assert!(InMemorySubagentRegistry::with_agents(vec![agent(" ", "")]).is_err());
        assert!(
            InMemorySubagentRegistry::with_agents(vec![agent("a", ""), agent("a", "")]).is_err()
        );
    }

    #[test]
    fn reload_diffs_against_loader() {
        let source = Arc::new(Mutex::new(vec![agent("a", "one"), agent("b", "two")]));
        let loader_source = Arc::clone(&source);
        let reg = InMemorySubagentRegistry::with_loader(Box::new(move || {
            Ok(loader_source.lock().clone())
        }))
        .unwrap();
        assert_eq!(reg.list().len(), 2);

        let mut rx = reg.subscribe();
        *source.lock() = vec![agent("a", "changed"), agent("c", "three")];
        reg.reload().unwrap();

        let mut events = drain(&mut rx);
        events.sort_by(|x, y| x.name().cmp(y.name()));
        assert_eq!(
            events,
            vec![
                RegistryEvent::Updated("a".into()),
                RegistryEvent::Removed("b".into()),
                RegistryEvent::Added("c".into()),
            ]
        );
    }

    #[test]
    fn reload_failure_keeps_current_set() {
        let fail = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fail);
        let reg = InMemorySubagentRegistry::with_loader(Box::new(move || {
            if *flag.lock() {
                Err(RegistryError::Load("disk gone".into()))
            } else {
                Ok(vec![agent("a", "")])
            }
        }))
        .unwrap();
        *fail.lock() = true;
        assert!(reg.reload().is_err());
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn converts_from_settings() {
        let s = SubagentSettings {
            name: "docs".into(),
            description: "writes docs".into(),
            tools: Some(vec!["view".into()]),
            max_turns: Some(5),
            ..Default::default()
        };
        let a = Subagent::from(s);
        assert_eq!(a.name, "docs");
        assert_eq!(a.tools.as_deref(), Some(&["view".to_string()][..]));
        assert_eq!(a.max_turns, Some(5));
    }
}
