//! Public entry point of the engine.
//!
//! The coordinator wires the run controller, tools, model slots and subagent
//! registry together and tracks a cancellation token per active run so the
//! whole engine can be stopped at shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument};

use helm_core::events::AgentEvent;
use helm_core::ids::{RunId, SessionId};
use helm_core::models::{ModelType, SelectedModel};
use helm_core::provider::{ProviderFactory, StreamOptions};
use helm_settings::Settings;
use helm_store::{Database, MessageRepo, Session, SessionRepo, StoreEvent};

use crate::emit;
use crate::error::EngineError;
use crate::model_queue::{ModelSlots, PendingModelUpdate};
use crate::orchestrator::{OrchestratorConfig, ToolOrchestrator};
use crate::permission::PermissionGate;
use crate::registry::ToolRegistry;
use crate::runner::{AgentProfile, RunController, RunResult, RunnerConfig};
use crate::status::{RunState, StatusHub, StatusReporter};
use crate::subagent::{InMemorySubagentRegistry, RegistryError, Subagent, SubagentRegistry};
use crate::tools::agent::{AgentTool, TaskAgentDefaults};
use crate::tools::create_default_registry;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding assistant working in the user's project. \
Use the tools to inspect files before answering, keep a todo list for multi-step work, and \
delegate self-contained investigations to sub-agents with the agent tool.";

/// Removes the run's cancellation handle when the run ends.
struct ActiveRun {
    active: Arc<DashMap<SessionId, (RunId, CancellationToken)>>,
    session_id: SessionId,
    run_id: RunId,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.session_id, |_, (run_id, _)| run_id == &self.run_id);
    }
}

pub struct Coordinator {
    db: Database,
    controller: Arc<RunController>,
    agent_tool: Arc<AgentTool>,
    profile: AgentProfile,
    status: Arc<StatusHub>,
    events: broadcast::Sender<AgentEvent>,
    active: Arc<DashMap<SessionId, (RunId, CancellationToken)>>,
    tracker: TaskTracker,
    admission: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        db: Database,
        factory: Arc<dyn ProviderFactory>,
        settings: &Settings,
        permissions: Arc<dyn PermissionGate>,
    ) -> Result<Self, EngineError> {
        let slots = Arc::new(ModelSlots::new(
            factory,
            settings.models.large.clone(),
            settings.models.small.clone(),
        )?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let status = Arc::new(StatusHub::new());

        let options_for = |provider: &str| {
            settings
                .provider_options(provider)
                .map_err(|e| EngineError::Internal(format!("provider options: {e}")))
        };
        let max_tokens = Some(settings.provider.max_output_tokens);

        let orchestrator = ToolOrchestrator::new(
            permissions,
            OrchestratorConfig::from(&settings.agent),
            events.clone(),
        );
        let controller = Arc::new(RunController::new(
            db.clone(),
            slots,
            orchestrator,
            events.clone(),
            Arc::clone(&status),
            RunnerConfig {
                disable_auto_summarize: settings.agent.disable_auto_summarize,
                summary_options: StreamOptions {
                    max_tokens,
                    provider_options: options_for(&settings.models.small.provider)?,
                    ..Default::default()
                },
            },
        ));

        let base_tools = create_default_registry(db.clone());
        let agent_tool = Arc::new(AgentTool::new(
            Arc::clone(&controller),
            base_tools.clone(),
            TaskAgentDefaults::from_settings(settings)?,
        ));
        if !settings.subagents.is_empty() {
            let agents = settings.subagents.iter().cloned().map(Subagent::from).collect();
            let registry = InMemorySubagentRegistry::with_agents(agents)?;
            agent_tool.set_registry(Some(Arc::new(registry)));
        }

        let mut tools: ToolRegistry = base_tools;
        tools.register(agent_tool.clone());

        let profile = AgentProfile {
            name: "coder".into(),
            system_prompt: settings
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into()),
            provider: None,
            options: StreamOptions {
                max_tokens,
                temperature: settings.agent.temperature,
                provider_options: options_for(&settings.models.large.provider)?,
                ..Default::default()
            },
            max_turns: settings.agent.max_turns,
            tools: Arc::new(tools),
        };

        Ok(Self {
            db,
            controller,
            agent_tool,
            profile,
            status,
            events,
            active: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            admission: Mutex::new(()),
        })
    }

    /// Run `prompt` against the session and wait for the final answer.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run(&self, session_id: &SessionId, prompt: &str) -> Result<RunResult, EngineError> {
        // Admission and the cancel sweep in `cancel_all` exclude each other:
        // a run is either registered and tracked before the sweep, or it sees
        // the closed tracker and is refused.
        let (tracked, _active) = {
            let _admission = self.admission.lock();
            if self.tracker.is_closed() {
                return Err(EngineError::RequestCancelled);
            }
            let guard = self.controller.acquire(session_id, prompt)?;
            let cancel = CancellationToken::new();
            self.active.insert(
                session_id.clone(),
                (guard.run_id().clone(), cancel.clone()),
            );
            let active = ActiveRun {
                active: Arc::clone(&self.active),
                session_id: session_id.clone(),
                run_id: guard.run_id().clone(),
            };
            let tracked = self.tracker.track_future(self.controller.run_with_guard(
                guard,
                prompt,
                &self.profile,
                cancel,
            ));
            (tracked, active)
        };
        tracked.await
    }

    /// Cancel one session's run. Returns false when nothing was running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.active.get(session_id) {
            Some(entry) => {
                entry.value().1.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.controller.is_busy(session_id)
    }

    /// Cancel every active run and wait until each has flushed and
    /// returned. New runs are refused while this is in progress.
    pub async fn cancel_all(&self) -> usize {
        let cancelled = {
            let _admission = self.admission.lock();
            self.tracker.close();
            let mut cancelled = 0;
            for entry in self.active.iter() {
                entry.value().1.cancel();
                cancelled += 1;
            }
            cancelled
        };
        self.tracker.wait().await;
        self.tracker.reopen();
        info!(cancelled, "all runs cancelled");
        cancelled
    }

    /// Apply the queued model change now. Streams already open keep the
    /// provider they started with.
    pub fn update_models(&self) -> Result<Option<PendingModelUpdate>, EngineError> {
        let applied = self.controller.slots().apply_pending()?;
        if let Some(update) = &applied {
            emit(
                &self.events,
                AgentEvent::ModelSwitched {
                    model_type: update.model_type,
                    model: update.model.clone(),
                },
            );
        }
        Ok(applied)
    }

    pub fn queue_model_update(&self, model_type: ModelType, model: SelectedModel) {
        self.controller.slots().queue().queue(model_type, model);
    }

    pub fn has_pending_model_update(&self) -> bool {
        self.controller.slots().queue().has_pending()
    }

    pub fn clear_pending_model_update(&self) {
        self.controller.slots().queue().clear();
    }

    pub fn selected_model(&self, model_type: ModelType) -> SelectedModel {
        self.controller.slots().selected(model_type)
    }

    pub fn set_subagent_registry(&self, registry: Option<Arc<dyn SubagentRegistry>>) {
        self.agent_tool.set_registry(registry);
    }

    pub fn list_subagents(&self) -> Vec<Arc<Subagent>> {
        self.agent_tool
            .registry()
            .map(|r| r.list())
            .unwrap_or_default()
    }

    pub fn reload_subagents(&self) -> Result<(), EngineError> {
        let registry = self.agent_tool.registry().ok_or(RegistryError::NotConfigured)?;
        registry.reload()?;
        Ok(())
    }

    /// Install or remove the external status sink.
    pub fn set_status_reporter(&self, reporter: Option<Arc<dyn StatusReporter>>) {
        self.status.set_reporter(reporter);
    }

    pub fn status(&self, session_id: &SessionId) -> RunState {
        self.status.state(session_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.db.subscribe()
    }

    pub fn create_session(&self, title: &str, working_directory: &str) -> Result<Session, EngineError> {
        Ok(self.controller.sessions().create(title, working_directory)?)
    }

    pub fn sessions(&self) -> &SessionRepo {
        self.controller.sessions()
    }

    pub fn messages(&self) -> &MessageRepo {
        self.controller.messages()
    }
}
