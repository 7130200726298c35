pub mod coordinator;
pub mod error;
pub mod model_queue;
pub mod orchestrator;
pub mod permission;
pub mod registry;
pub mod runner;
pub mod status;
pub mod subagent;
pub mod summarize;
pub mod tools;
pub mod truncate;

#[cfg(test)]
mod test_support;

pub use coordinator::Coordinator;
pub use error::EngineError;
pub use model_queue::{ModelSlots, ModelUpdateQueue, PendingModelUpdate};
pub use orchestrator::{OrchestratorConfig, ToolOrchestrator, ToolScope};
pub use permission::{AllowTools, AutoApprove, DenyAll, PermissionGate, PermissionRequest};
pub use registry::{ToolFilter, ToolRegistry};
pub use runner::{AgentProfile, RunController, RunResult};
pub use status::{LoggingReporter, RunState, StatusReporter};
pub use subagent::{InMemorySubagentRegistry, RegistryEvent, Subagent, SubagentRegistry};

use helm_core::events::AgentEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast an engine event. Nobody listening is normal for headless runs.
pub(crate) fn emit(tx: &broadcast::Sender<AgentEvent>, event: AgentEvent) {
    if let Err(broadcast::error::SendError(event)) = tx.send(event) {
        debug!(event = event.event_type(), "no event receivers, event dropped");
    }
}
