//! Dispatch of the tool calls emitted by one assistant turn.
//!
//! Each call is resolved against the registry, parsed into its typed input,
//! cleared with the permission gate and executed. Failures stay inside the
//! call's own result slot; only `ToolError::Fatal` aborts the turn.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use helm_core::events::AgentEvent;
use helm_core::ids::{MessageId, SessionId};
use helm_core::messages::{ToolCall, ToolResult};
use helm_core::tool_params::ToolInput;
use helm_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolOutput};
use helm_settings::AgentSettings;

use crate::emit;
use crate::error::EngineError;
use crate::permission::{PermissionGate, PermissionRequest};
use crate::registry::ToolRegistry;
use crate::truncate;

/// How long a cancelled tool gets to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub tool_timeout: Duration,
    pub max_parallel: usize,
    pub max_output_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for OrchestratorConfig {
    fn from(s: &AgentSettings) -> Self {
        Self {
            tool_timeout: Duration::from_millis(s.tool_timeout_ms),
            max_parallel: s.max_parallel_tools.max(1),
            max_output_bytes: s.max_tool_output_bytes,
        }
    }
}

/// Where a batch of calls runs: the session, the assistant message that
/// issued them, and the run's cancellation token.
#[derive(Clone, Debug)]
pub struct ToolScope {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub working_directory: PathBuf,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ToolOrchestrator {
    permissions: Arc<dyn PermissionGate>,
    config: OrchestratorConfig,
    events: broadcast::Sender<AgentEvent>,
}

/// Outcome of [`ToolOrchestrator::execute_batch`].
#[derive(Debug)]
pub struct ToolBatch {
    /// One result per call, in call order.
    pub results: Vec<ToolResult>,
    /// The first fatal error, if any. The run must stop after persisting
    /// `results`.
    pub fatal: Option<ToolError>,
}

enum Finished {
    Done(std::thread::Result<Result<ToolOutput, ToolError>>),
    TimedOut,
    Cancelled,
}

impl ToolOrchestrator {
    pub fn new(
        permissions: Arc<dyn PermissionGate>,
        config: OrchestratorConfig,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            permissions,
            config,
            events,
        }
    }

    /// Execute `calls` and return one result per call, in call order.
    ///
    /// A fatal tool error is returned as `Err` and the results of the other
    /// calls are dropped. Callers that persist the batch use
    /// [`execute_batch`](Self::execute_batch) instead.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCall],
        scope: &ToolScope,
    ) -> Result<Vec<ToolResult>, EngineError> {
        let batch = self.execute_batch(registry, calls, scope).await;
        match batch.fatal {
            Some(e) => Err(EngineError::Tool(e)),
            None => Ok(batch.results),
        }
    }

    /// Execute `calls`, always producing one result per call in call order.
    ///
    /// Concurrent tools run first, bounded by `max_parallel`; sequential tools
    /// then run one at a time. Unknown tools count as concurrent since they
    /// only produce an error result. After a fatal error no further
    /// sequential tool starts; the fatal call and every call that did not run
    /// get error results so the batch still answers each call.
    pub async fn execute_batch(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCall],
        scope: &ToolScope,
    ) -> ToolBatch {
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut fatal: Option<ToolError> = None;

        let mut concurrent = Vec::new();
        let mut sequential = Vec::new();
        for (idx, call) in calls.iter().enumerate() {
            let tool = registry.get(&call.name);
            let mode = tool
                .as_ref()
                .map(|t| t.execution_mode())
                .unwrap_or(ExecutionMode::Concurrent);
            match mode {
                ExecutionMode::Concurrent => concurrent.push((idx, call.clone(), tool)),
                ExecutionMode::Sequential => sequential.push((idx, call.clone(), tool)),
            }
        }

        if !concurrent.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
            let mut join_set = JoinSet::new();
            for (idx, call, tool) in concurrent {
                let this = self.clone();
                let scope = scope.clone();
                let sem = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let outcome = match sem.acquire_owned().await {
                        Ok(_permit) => this.run_one(tool, &call, &scope).await,
                        Err(e) => Ok(ToolResult::error(&call, format!("scheduler closed: {e}"))),
                    };
                    (idx, outcome)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((idx, Ok(result))) => slots[idx] = Some(result),
                    Ok((idx, Err(e))) => {
                        error!(session_id = %scope.session_id, error = %e, "fatal tool error");
                        slots[idx] = Some(ToolResult::error(&calls[idx], e.to_string()));
                        fatal.get_or_insert(e);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "tool task failed");
                    }
                }
            }
        }

        for (idx, call, tool) in sequential {
            if fatal.is_some() {
                break;
            }
            match self.run_one(tool, &call, scope).await {
                Ok(result) => slots[idx] = Some(result),
                Err(e) => {
                    error!(session_id = %scope.session_id, error = %e, "fatal tool error");
                    slots[idx] = Some(ToolResult::error(&call, e.to_string()));
                    fatal = Some(e);
                }
            }
        }

        let missing = if fatal.is_some() {
            "not run: an earlier tool call failed"
        } else {
            "tool execution failed"
        };
        let results = slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| slot.unwrap_or_else(|| ToolResult::error(call, missing)))
            .collect();
        ToolBatch { results, fatal }
    }

    async fn run_one(
        &self,
        tool: Option<Arc<dyn Tool>>,
        call: &ToolCall,
        scope: &ToolScope,
    ) -> Result<ToolResult, ToolError> {
        let Some(tool) = tool else {
            return Ok(ToolResult::error(call, format!("unknown tool: {}", call.name)));
        };
        if scope.cancel.is_cancelled() {
            return Ok(ToolResult::error(call, "cancelled"));
        }
        let input = match ToolInput::parse(&call.name, call.input.clone()) {
            Ok(input) => input,
            Err(e) => return Ok(ToolResult::error(call, e.to_string())),
        };

        let target = tool.permission_target(&input);
        let request = PermissionRequest {
            session_id: scope.session_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            path: target.path,
            description: target.description,
            params: call.input.clone(),
        };
        let decision = tokio::select! {
            _ = scope.cancel.cancelled() => return Ok(ToolResult::error(call, "cancelled")),
            d = self.permissions.request(&request) => d,
        };
        match decision {
            Ok(true) => {}
            Ok(false) => {
                debug!(tool = %call.name, "permission denied");
                return Ok(ToolResult::error(
                    call,
                    format!("permission denied: {}", request.description),
                ));
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "permission gate failed");
                return Ok(ToolResult::error(call, e.to_string()));
            }
        }

        emit(
            &self.events,
            AgentEvent::ToolStart {
                session_id: scope.session_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            },
        );

        let ctx = ToolContext {
            session_id: scope.session_id.clone(),
            message_id: Some(scope.message_id.clone()),
            tool_call_id: call.id.clone(),
            working_directory: scope.working_directory.clone(),
            cancel: scope.cancel.child_token(),
        };
        let timeout = tool.timeout().unwrap_or(self.config.tool_timeout);
        let start = Instant::now();

        let exec = AssertUnwindSafe(tool.execute(input, &ctx)).catch_unwind();
        tokio::pin!(exec);
        let finished = tokio::select! {
            r = tokio::time::timeout(timeout, &mut exec) => match r {
                Ok(done) => Finished::Done(done),
                Err(_) => Finished::TimedOut,
            },
            _ = scope.cancel.cancelled() => {
                match tokio::time::timeout(CANCEL_GRACE, &mut exec).await {
                    Ok(done) => Finished::Done(done),
                    Err(_) => Finished::Cancelled,
                }
            }
        };
        let duration = start.elapsed();

        let result = match finished {
            Finished::Done(Ok(Ok(output))) => ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: truncate::truncate_output(&output.content, self.config.max_output_bytes),
                is_error: output.is_error,
            },
            Finished::Done(Ok(Err(e))) if e.is_fatal() => {
                self.emit_end(scope, call, true, duration);
                return Err(e);
            }
            Finished::Done(Ok(Err(e))) => ToolResult::error(call, e.to_string()),
            Finished::Done(Err(panic)) => {
                error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                ToolResult::error(call, "internal error: tool crashed")
            }
            Finished::TimedOut => {
                warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                ToolResult::error(call, ToolError::Timeout(timeout).to_string())
            }
            Finished::Cancelled => ToolResult::error(call, ToolError::Cancelled.to_string()),
        };

        self.emit_end(scope, call, result.is_error, duration);
        Ok(result)
    }

    fn emit_end(&self, scope: &ToolScope, call: &ToolCall, is_error: bool, duration: Duration) {
        emit(
            &self.events,
            AgentEvent::ToolEnd {
                session_id: scope.session_id.clone(),
                tool_call_id: call.id.clone(),
                is_error,
                duration_ms: duration.as_millis() as u64,
            },
        );
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
