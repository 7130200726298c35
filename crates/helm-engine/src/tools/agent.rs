//! The "agent" tool: delegates a task to a nested agent running in its own
//! task session, then rolls the child's spend up into the parent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use helm_core::events::AgentEvent;
use helm_core::ids::{MessageId, SessionId, ToolCallId};
use helm_core::models::SelectedModel;
use helm_core::provider::StreamOptions;
use helm_core::tool_params::{self, ToolInput};
use helm_core::tools::{ExecutionMode, PermissionTarget, Tool, ToolContext, ToolError, ToolOutput};
use helm_settings::Settings;
use helm_store::{SessionRepo, StoreError};

use crate::emit;
use crate::error::EngineError;
use crate::registry::{ToolFilter, ToolRegistry};
use crate::runner::{AgentProfile, RunController};
use crate::subagent::{RegistryError, Subagent, SubagentRegistry};

const DEFAULT_AGENT_NAME: &str = "task";
const DEFAULT_TASK_PROMPT: &str = "You are a focused sub-agent. Complete the delegated task \
using the tools available, then reply with a concise final answer containing everything the \
caller needs. Do not ask questions.";
const DEFAULT_TASK_MAX_TURNS: u32 = 25;
const DELEGATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Configuration of the fallback task agent.
#[derive(Clone, Debug)]
pub struct TaskAgentDefaults {
    pub system_prompt: String,
    /// `None` runs on the live large model.
    pub model: Option<SelectedModel>,
    pub options: StreamOptions,
    pub max_turns: u32,
}

impl Default for TaskAgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_TASK_PROMPT.into(),
            model: None,
            options: StreamOptions::default(),
            max_turns: DEFAULT_TASK_MAX_TURNS,
        }
    }
}

impl TaskAgentDefaults {
    pub fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        let task = &settings.task_agent;
        let provider_name = task
            .model
            .as_ref()
            .unwrap_or(&settings.models.large)
            .provider
            .clone();
        let provider_options = settings
            .provider_options(&provider_name)
            .map_err(|e| EngineError::Internal(format!("provider options: {e}")))?;
        Ok(Self {
            system_prompt: task
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_TASK_PROMPT.into()),
            model: task.model.clone(),
            options: StreamOptions {
                max_tokens: Some(settings.provider.max_output_tokens),
                temperature: task.temperature,
                frequency_penalty: task.frequency_penalty,
                presence_penalty: task.presence_penalty,
                provider_options,
            },
            max_turns: task.max_turns.unwrap_or(DEFAULT_TASK_MAX_TURNS),
        })
    }
}

/// Child session id for a delegation. Derived from the originating message
/// and tool call so a repeated call lands in the same session.
pub fn task_session_id(message_id: &MessageId, tool_call_id: &ToolCallId) -> SessionId {
    let digest = Sha256::digest(format!("{message_id}:{tool_call_id}").as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    SessionId::from_raw(format!("{}_task_{hex}", SessionId::PREFIX))
}

/// Description and built profiles, dropped whenever the registry changes.
#[derive(Clone, Default)]
struct Caches {
    description: Arc<RwLock<Option<String>>>,
    profiles: Arc<DashMap<String, AgentProfile>>,
}

impl Caches {
    fn invalidate(&self) {
        *self.description.write() = None;
        self.profiles.clear();
    }
}

pub struct AgentTool {
    controller: Arc<RunController>,
    base_tools: Arc<ToolRegistry>,
    defaults: TaskAgentDefaults,
    registry: RwLock<Option<Arc<dyn SubagentRegistry>>>,
    caches: Caches,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AgentTool {
    /// `base_tools` is what delegated agents may use. It must not contain
    /// the agent tool itself.
    pub fn new(
        controller: Arc<RunController>,
        base_tools: ToolRegistry,
        defaults: TaskAgentDefaults,
    ) -> Self {
        let mut base_tools = base_tools;
        base_tools.unregister(tool_params::AGENT);
        Self {
            controller,
            base_tools: Arc::new(base_tools),
            defaults,
            registry: RwLock::new(None),
            caches: Caches::default(),
            listener: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Option<Arc<dyn SubagentRegistry>> {
        self.registry.read().clone()
    }

    /// Swap the registry and start following its change events.
    pub fn set_registry(&self, registry: Option<Arc<dyn SubagentRegistry>>) {
        let mut listener = self.listener.lock();
        if let Some(handle) = listener.take() {
            handle.abort();
        }
        *listener = registry
            .as_ref()
            .and_then(|r| spawn_invalidation_listener(r.as_ref(), self.caches.clone()));
        *self.registry.write() = registry;
        self.caches.invalidate();
    }

    fn build_description(&self) -> String {
        let mut text = String::from(
            "Delegate a self-contained task to a sub-agent. It runs in its own session with \
             its own tools and returns its final answer.",
        );
        let agents = self.registry().map(|r| r.list()).unwrap_or_default();
        if agents.is_empty() {
            text.push_str(" Omit `subagent` to use the general task agent.");
        } else {
            text.push_str("\n\nAvailable sub-agents:\n");
            for agent in &agents {
                text.push_str(&format!("- {}: {}\n", agent.name, agent.description));
            }
            text.push_str("Omit `subagent` to use the general task agent.");
        }
        text
    }

    fn default_profile(&self) -> AgentProfile {
        let provider = match &self.defaults.model {
            Some(model) => match self.controller.slots().build(model) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(model = %model, error = %e, "task agent model unavailable, using large model");
                    None
                }
            },
            None => None,
        };
        AgentProfile {
            name: DEFAULT_AGENT_NAME.into(),
            system_prompt: self.defaults.system_prompt.clone(),
            provider,
            options: self.defaults.options.clone(),
            max_turns: self.defaults.max_turns,
            tools: Arc::clone(&self.base_tools),
        }
    }

    fn build_profile(&self, agent: &Subagent) -> Result<AgentProfile, EngineError> {
        let provider = match &agent.model {
            Some(model) => Some(self.controller.slots().build(model)?),
            None => self.default_profile().provider,
        };
        let filter = ToolFilter::from_lists(agent.tools.as_deref(), &agent.exclude_tools);
        Ok(AgentProfile {
            name: agent.name.clone(),
            system_prompt: agent.system_prompt.clone(),
            provider,
            options: StreamOptions {
                temperature: agent.temperature,
                frequency_penalty: agent.frequency_penalty,
                presence_penalty: agent.presence_penalty,
                ..self.defaults.options.clone()
            },
            max_turns: agent.max_turns.unwrap_or(self.defaults.max_turns),
            tools: Arc::new(self.base_tools.clone_for_subagent(&filter)),
        })
    }

    /// Profile for `name`. Anything that keeps a named agent from being
    /// built falls back to the default task agent.
    fn resolve_profile(&self, name: Option<&str>) -> AgentProfile {
        let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
            return self.default_profile();
        };
        if let Some(cached) = self.caches.profiles.get(name) {
            return cached.clone();
        }
        let built = self
            .registry()
            .ok_or(RegistryError::NotConfigured)
            .and_then(|r| r.get(name).ok_or_else(|| RegistryError::Unknown(name.to_string())))
            .map_err(EngineError::from)
            .and_then(|agent| self.build_profile(&agent));
        match built {
            Ok(profile) => {
                self.caches.profiles.insert(name.to_string(), profile.clone());
                profile
            }
            Err(e) => {
                warn!(subagent = name, error = %e, "falling back to default task agent");
                self.default_profile()
            }
        }
    }
}

impl Drop for AgentTool {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

fn spawn_invalidation_listener(
    registry: &dyn SubagentRegistry,
    caches: Caches,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("no tokio runtime, subagent changes will not refresh the agent tool");
        return None;
    };
    let mut rx = registry.subscribe();
    Some(runtime.spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    debug!(subagent = %event.name(), "invalidating agent tool caches");
                    caches.invalidate();
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subagent events lagged");
                    caches.invalidate();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        tool_params::AGENT
    }

    fn description(&self) -> String {
        if let Some(cached) = self.caches.description.read().clone() {
            return cached;
        }
        let built = self.build_description();
        *self.caches.description.write() = Some(built.clone());
        built
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["prompt"],
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The complete task for the sub-agent"
                },
                "subagent": {
                    "type": "string",
                    "description": "Name of a registered sub-agent (optional)"
                }
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DELEGATION_TIMEOUT)
    }

    fn permission_target(&self, input: &ToolInput) -> PermissionTarget {
        let who = match input {
            ToolInput::Agent(p) => p.subagent.as_deref().unwrap_or(DEFAULT_AGENT_NAME),
            _ => DEFAULT_AGENT_NAME,
        };
        PermissionTarget {
            path: None,
            description: format!("delegate a task to the {who} agent"),
        }
    }

    async fn execute(&self, input: ToolInput, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let ToolInput::Agent(params) = input else {
            return Err(ToolError::InvalidArguments("agent: unexpected input".into()));
        };
        if ctx.session_id.is_blank() {
            return Err(ToolError::Fatal("agent tool called without a session".into()));
        }
        let Some(message_id) = &ctx.message_id else {
            return Err(ToolError::Fatal(
                "agent tool called without an originating message".into(),
            ));
        };

        let profile = self.resolve_profile(params.subagent.as_deref());
        let child_id = task_session_id(message_id, &ctx.tool_call_id);
        let sessions = self.controller.sessions();

        let title: String = params.prompt.chars().take(60).collect();
        let child = sessions
            .create_task_session(&child_id, &ctx.session_id, &format!("{}: {title}", profile.name))
            .map_err(|e| ToolError::Fatal(format!("create task session: {e}")))?;
        let cost_before = child.cost;

        info!(
            parent = %ctx.session_id,
            child = %child_id,
            subagent = %profile.name,
            "delegating to sub-agent"
        );
        emit(
            self.controller.events(),
            AgentEvent::SubagentStart {
                parent_session_id: ctx.session_id.clone(),
                child_session_id: child_id.clone(),
                subagent: profile.name.clone(),
            },
        );

        let mut rollup = CostRollup {
            sessions,
            parent: ctx.session_id.clone(),
            child: child_id.clone(),
            before: cost_before,
            settled: false,
        };
        let outcome = self
            .controller
            .run(&child_id, &params.prompt, &profile, ctx.cancel.child_token())
            .await;
        let child_cost = rollup
            .settle()
            .map_err(|e| ToolError::Fatal(format!("roll up sub-agent cost: {e}")))?;
        emit(
            self.controller.events(),
            AgentEvent::SubagentComplete {
                parent_session_id: ctx.session_id.clone(),
                child_session_id: child_id.clone(),
                cost: child_cost,
                is_error: outcome.is_err(),
            },
        );

        match outcome {
            Ok(result) => {
                let text = result.text();
                let text = if text.trim().is_empty() {
                    "(sub-agent returned no text)".to_string()
                } else {
                    text
                };
                Ok(ToolOutput::text(text, start.elapsed()))
            }
            Err(EngineError::RequestCancelled) => Err(ToolError::Cancelled),
            Err(EngineError::Store(e)) => Err(ToolError::Fatal(format!("sub-agent storage: {e}"))),
            Err(e) => {
                warn!(child = %child_id, error = %e, "sub-agent run failed");
                Ok(ToolOutput::error("error generating response", start.elapsed()))
            }
        }
    }
}

/// Adds the child's spend since `before` to the parent. Also runs on drop,
/// for delegations abandoned mid-run by a timeout or cancel grace.
struct CostRollup<'a> {
    sessions: &'a SessionRepo,
    parent: SessionId,
    child: SessionId,
    before: f64,
    settled: bool,
}

impl CostRollup<'_> {
    fn settle(&mut self) -> Result<f64, StoreError> {
        self.settled = true;
        let child = self.sessions.get(&self.child)?;
        let delta = (child.cost - self.before).max(0.0);
        if delta > 0.0 {
            self.sessions.add_cost(&self.parent, delta)?;
        }
        Ok(delta)
    }
}

impl Drop for CostRollup<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.settle() {
            Ok(cost) => debug!(
                parent = %self.parent,
                child = %self.child,
                cost,
                "rolled up cost of abandoned delegation"
            ),
            Err(e) => warn!(
                parent = %self.parent,
                child = %self.child,
                error = %e,
                "cost roll-up for abandoned delegation failed"
            ),
        }
    }
}
