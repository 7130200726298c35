//! Run state tracking and the optional external status sink.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use helm_core::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Thinking,
    Streaming,
    ToolRunning,
    Summarizing,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Streaming => "streaming",
            Self::ToolRunning => "tool_running",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("status report failed: {0}")]
pub struct ReportError(pub String);

/// External sink notified on every state transition.
pub trait StatusReporter: Send + Sync {
    fn report(&self, session_id: &SessionId, state: RunState) -> Result<(), ReportError>;
}

/// Writes transitions to the log.
pub struct LoggingReporter;

impl StatusReporter for LoggingReporter {
    fn report(&self, session_id: &SessionId, state: RunState) -> Result<(), ReportError> {
        info!(session_id = %session_id, state = %state, "run state");
        Ok(())
    }
}

/// Tracks the current state per session and forwards transitions to the
/// configured reporter. Reporter errors and panics are logged and swallowed.
#[derive(Default)]
pub struct StatusHub {
    states: DashMap<SessionId, RunState>,
    reporter: RwLock<Option<Arc<dyn StatusReporter>>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reporter(&self, reporter: Option<Arc<dyn StatusReporter>>) {
        *self.reporter.write() = reporter;
    }

    pub fn state(&self, session_id: &SessionId) -> RunState {
        self.states
            .get(session_id)
            .map(|s| *s)
            .unwrap_or(RunState::Idle)
    }

    /// Record a transition. A terminal state is reported and then the
    /// session drops back to `Idle`, so finished sessions hold no entry.
    pub fn set(&self, session_id: &SessionId, state: RunState) {
        if state.is_terminal() {
            if self.states.remove(session_id).is_none() {
                return;
            }
            self.report(session_id, state);
            self.report(session_id, RunState::Idle);
            return;
        }
        let previous = self.states.insert(session_id.clone(), state);
        if previous == Some(state) {
            return;
        }
        self.report(session_id, state);
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    fn report(&self, session_id: &SessionId, state: RunState) {
        let reporter = self.reporter.read().clone();
        let Some(reporter) = reporter else {
            return;
        };
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| reporter.report(session_id, state)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "status reporter failed"),
            Err(_) => warn!(session_id = %session_id, "status reporter panicked"),
        }
    }
}
