//! Shared fixtures for engine unit tests.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use helm_core::events::AgentEvent;
use helm_core::messages::Message;
use helm_core::models::SelectedModel;
use helm_llm::mock::{MockProvider, MockProviderFactory, MockResponse};
use helm_store::{Database, Session, SessionRepo};

use crate::error::EngineError;
use crate::model_queue::ModelSlots;
use crate::orchestrator::{OrchestratorConfig, ToolOrchestrator};
use crate::permission::AutoApprove;
use crate::runner::{AgentProfile, RunController, RunResult, RunnerConfig};
use crate::status::StatusHub;
use crate::tools::create_default_registry;

pub(crate) struct Harness {
    pub db: Database,
    pub factory: Arc<MockProviderFactory>,
    pub large: Arc<MockProvider>,
    pub small: Arc<MockProvider>,
    pub controller: Arc<RunController>,
    pub profile: AgentProfile,
    pub session: Session,
    pub status: Arc<StatusHub>,
    pub events: broadcast::Sender<AgentEvent>,
    pub dir: PathBuf,
}

impl Harness {
    pub fn new(large: Vec<MockResponse>, small: Vec<MockResponse>) -> Self {
        Self::with_config(large, small, RunnerConfig::default())
    }

    pub fn with_config(
        large: Vec<MockResponse>,
        small: Vec<MockResponse>,
        config: RunnerConfig,
    ) -> Self {
        let db = Database::in_memory().unwrap();
        let factory = Arc::new(MockProviderFactory::new());
        let large = Arc::new(MockProvider::new(large).with_model("mock", "large"));
        let small = Arc::new(MockProvider::new(small).with_model("mock", "small"));
        factory.register("large", Arc::clone(&large));
        factory.register("small", Arc::clone(&small));

        let slots = Arc::new(
            ModelSlots::new(
                factory.clone(),
                SelectedModel::new("mock", "large"),
                SelectedModel::new("mock", "small"),
            )
            .unwrap(),
        );
        let (events, _) = broadcast::channel(256);
        let status = Arc::new(StatusHub::new());
        let orchestrator = ToolOrchestrator::new(
            Arc::new(AutoApprove),
            OrchestratorConfig::default(),
            events.clone(),
        );
        let controller = Arc::new(RunController::new(
            db.clone(),
            slots,
            orchestrator,
            events.clone(),
            Arc::clone(&status),
            config,
        ));

        let dir = std::env::temp_dir().join(format!("helm_engine_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.rs"), "fn main() {}\n").unwrap();
        let session = SessionRepo::new(db.clone())
            .create("test", &dir.to_string_lossy())
            .unwrap();

        let profile = AgentProfile {
            name: "test".into(),
            system_prompt: "You are a test agent.".into(),
            provider: None,
            options: Default::default(),
            max_turns: 10,
            tools: Arc::new(create_default_registry(db.clone())),
        };

        Self {
            db,
            factory,
            large,
            small,
            controller,
            profile,
            session,
            status,
            events,
            dir,
        }
    }

    pub async fn run(&self, prompt: &str) -> Result<RunResult, EngineError> {
        self.controller
            .run(&self.session.id, prompt, &self.profile, CancellationToken::new())
            .await
    }

    pub fn messages(&self) -> Vec<Message> {
        self.controller.messages().list(&self.session.id).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}
