//! The per-session run loop.
//!
//! A run streams one model turn at a time, dispatches the tool calls it
//! produces and loops until the model answers without calling tools. A
//! context overflow is recovered once per run by summarizing the history with
//! the small model and restarting from the summary.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use helm_core::classify::{self, INPUT_TOO_LONG_PATTERNS};
use helm_core::context::LlmContext;
use helm_core::errors::GatewayError;
use helm_core::events::AgentEvent;
use helm_core::ids::{RunId, SessionId};
use helm_core::messages::{ContentPart, FinishReason, Message, Role};
use helm_core::provider::{LlmProvider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::usage::TokenUsage;
use helm_store::{Database, MessageRepo, Session, SessionRepo};

use crate::emit;
use crate::error::EngineError;
use crate::model_queue::ModelSlots;
use crate::orchestrator::{ToolOrchestrator, ToolScope};
use crate::registry::ToolRegistry;
use crate::status::{RunState, StatusHub};
use crate::summarize;

/// Stricter overflow check used for reporting: status 400 plus a known
/// overflow message. Recovery itself keys off the status-agnostic
/// [`classify::is_input_too_long_error`].
pub fn is_context_length_exceeded(err: &(dyn StdError + 'static)) -> bool {
    classify::provider_error(err).is_some_and(|pe| {
        let folded = pe.message.to_lowercase();
        pe.status_code == 400 && INPUT_TOO_LONG_PATTERNS.iter().any(|p| folded.contains(p))
    })
}

/// Who is running: prompt, model, sampling parameters and tools.
#[derive(Clone)]
pub struct AgentProfile {
    pub name: String,
    pub system_prompt: String,
    /// Pinned provider. `None` follows the live large model, so queued model
    /// switches apply between turns.
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub options: StreamOptions,
    pub max_turns: u32,
    pub tools: Arc<ToolRegistry>,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub session_id: SessionId,
    pub run_id: RunId,
    /// Final assistant message.
    pub message: Message,
    pub turns: u32,
    pub usage: TokenUsage,
    /// Spend of this run, including summarization.
    pub cost: f64,
    pub summarized: bool,
}

impl RunResult {
    pub fn text(&self) -> String {
        self.message.text_content()
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunnerConfig {
    pub disable_auto_summarize: bool,
    pub summary_options: StreamOptions,
}

/// Marks a session busy for as long as it is alive.
#[derive(Debug)]
pub struct SessionGuard {
    busy: Arc<DashMap<SessionId, RunId>>,
    session_id: SessionId,
    run_id: RunId,
}

impl SessionGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.busy
            .remove_if(&self.session_id, |_, run| run == &self.run_id);
    }
}

struct TurnOutput {
    message: Message,
    usage: TokenUsage,
    cost: f64,
}

pub struct RunController {
    sessions: SessionRepo,
    messages: MessageRepo,
    slots: Arc<ModelSlots>,
    orchestrator: ToolOrchestrator,
    busy: Arc<DashMap<SessionId, RunId>>,
    events: broadcast::Sender<AgentEvent>,
    status: Arc<StatusHub>,
    config: RunnerConfig,
}

impl RunController {
    pub fn new(
        db: Database,
        slots: Arc<ModelSlots>,
        orchestrator: ToolOrchestrator,
        events: broadcast::Sender<AgentEvent>,
        status: Arc<StatusHub>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            slots,
            orchestrator,
            busy: Arc::new(DashMap::new()),
            events,
            status,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageRepo {
        &self.messages
    }

    pub fn slots(&self) -> &Arc<ModelSlots> {
        &self.slots
    }

    pub fn events(&self) -> &broadcast::Sender<AgentEvent> {
        &self.events
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.busy.contains_key(session_id)
    }

    /// Claim the session. Fails fast: a busy session is never queued.
    pub fn acquire(&self, session_id: &SessionId, prompt: &str) -> Result<SessionGuard, EngineError> {
        if session_id.is_blank() {
            return Err(EngineError::SessionMissing("session id is empty".into()));
        }
        if self.busy.contains_key(session_id) {
            return Err(EngineError::SessionBusy(session_id.clone()));
        }
        if prompt.trim().is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        let run_id = RunId::new();
        match self.busy.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::SessionBusy(session_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(run_id.clone());
                Ok(SessionGuard {
                    busy: Arc::clone(&self.busy),
                    session_id: session_id.clone(),
                    run_id,
                })
            }
        }
    }

    pub async fn run(
        &self,
        session_id: &SessionId,
        prompt: &str,
        profile: &AgentProfile,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let guard = self.acquire(session_id, prompt)?;
        self.run_with_guard(guard, prompt, profile, cancel).await
    }

    /// Run on an already claimed session. The claim is released on return.
    #[instrument(skip_all, fields(session_id = %guard.session_id, run_id = %guard.run_id, agent = %profile.name))]
    pub async fn run_with_guard(
        &self,
        guard: SessionGuard,
        prompt: &str,
        profile: &AgentProfile,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let session_id = guard.session_id.clone();
        emit(
            &self.events,
            AgentEvent::RunStart {
                session_id: session_id.clone(),
            },
        );
        self.status.set(&session_id, RunState::Thinking);

        let result = self.run_loop(&guard, prompt, profile, &cancel).await;
        let result = match result {
            Err(EngineError::Gateway(GatewayError::Cancelled)) if cancel.is_cancelled() => {
                Err(EngineError::RequestCancelled)
            }
            other => other,
        };

        match &result {
            Ok(r) => {
                info!(turns = r.turns, cost = r.cost, summarized = r.summarized, "run complete");
                self.status.set(&session_id, RunState::Done);
            }
            Err(e) if e.is_cancelled() => {
                info!("run cancelled");
                self.status.set(&session_id, RunState::Failed);
            }
            Err(e) => {
                warn!(error = %e, "run failed");
                self.status.set(&session_id, RunState::Failed);
            }
        }
        emit(
            &self.events,
            AgentEvent::RunEnd {
                session_id,
                error: result.as_ref().err().map(|e| e.to_string()),
            },
        );
        drop(guard);
        result
    }

    async fn run_loop(
        &self,
        guard: &SessionGuard,
        prompt: &str,
        profile: &AgentProfile,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let session_id = &guard.session_id;
        let session = self.load_session(session_id)?;
        let working_directory = if session.working_directory.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&session.working_directory)
        };
        self.messages
            .create(&Message::user_text(session_id.clone(), prompt))?;

        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut summarized = false;
        let mut turn: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::RequestCancelled);
            }
            if turn >= profile.max_turns {
                return Err(EngineError::MaxTurnsExceeded(profile.max_turns));
            }
            turn += 1;

            self.apply_pending_models();
            let provider = profile
                .provider
                .clone()
                .unwrap_or_else(|| self.slots.large());

            let session = self.load_session(session_id)?;
            let mut context = LlmContext::new(profile.system_prompt.clone());
            context.messages = self.history(&session)?;
            context.tools = profile.tools.definitions();

            emit(
                &self.events,
                AgentEvent::TurnStart {
                    session_id: session_id.clone(),
                    turn,
                },
            );
            self.status.set(session_id, RunState::Thinking);

            let output = match self
                .stream_turn(provider.as_ref(), &context, &profile.options, session_id, cancel)
                .await
            {
                Ok(output) => output,
                Err(EngineError::Gateway(err)) if classify::is_input_too_long_error(&err) => {
                    let strict = is_context_length_exceeded(&err);
                    warn!(turn, strict, error = %err, "context window exceeded");
                    emit(
                        &self.events,
                        AgentEvent::ContextOverflow {
                            session_id: session_id.clone(),
                            strict,
                        },
                    );
                    if self.config.disable_auto_summarize || summarized {
                        return Err(EngineError::Gateway(err));
                    }
                    let (summary_usage, summary_cost) =
                        self.summarize_and_resume(session_id, prompt, cancel).await?;
                    usage.add(&summary_usage);
                    cost += summary_cost;
                    summarized = true;
                    turn -= 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            usage.add(&output.usage);
            cost += output.cost;
            emit(
                &self.events,
                AgentEvent::TurnComplete {
                    session_id: session_id.clone(),
                    turn,
                    usage: output.usage,
                    cost: output.cost,
                },
            );

            let calls: Vec<_> = output.message.tool_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                return Ok(RunResult {
                    session_id: session_id.clone(),
                    run_id: guard.run_id.clone(),
                    message: output.message,
                    turns: turn,
                    usage,
                    cost,
                    summarized,
                });
            }

            self.status.set(session_id, RunState::ToolRunning);
            let scope = ToolScope {
                session_id: session_id.clone(),
                message_id: output.message.id.clone(),
                working_directory: working_directory.clone(),
                cancel: cancel.clone(),
            };
            let batch = self
                .orchestrator
                .execute_batch(&profile.tools, &calls, &scope)
                .await;
            // Every call gets an answer on disk, so the history stays valid
            // for the next run even when this one stops here.
            self.messages
                .create(&Message::tool_results(session_id.clone(), batch.results))?;
            if let Some(e) = batch.fatal {
                return Err(EngineError::Tool(e));
            }
        }
    }

    /// One model call. The assistant message is persisted once the stream
    /// opens and saved again when it ends, including on error or cancel.
    async fn stream_turn(
        &self,
        provider: &dyn LlmProvider,
        context: &LlmContext,
        options: &StreamOptions,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, EngineError> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::RequestCancelled),
            s = provider.stream(context, options) => s?,
        };

        let mut message = self.messages.create(&Message::assistant(
            session_id.clone(),
            provider.name(),
            provider.model(),
        ))?;
        let mut usage = TokenUsage::default();
        let mut finish = None;
        let mut streaming = false;

        let outcome: Result<(), EngineError> = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Err(EngineError::RequestCancelled),
                e = stream.next() => e,
            };
            match event {
                Some(StreamEvent::TextDelta { delta }) => {
                    if !streaming {
                        streaming = true;
                        self.status.set(session_id, RunState::Streaming);
                    }
                    message.append_text_delta(&delta);
                    emit(
                        &self.events,
                        AgentEvent::TextDelta {
                            session_id: session_id.clone(),
                            delta,
                        },
                    );
                }
                Some(StreamEvent::ReasoningDelta { delta }) => {
                    message.append_reasoning_delta(&delta);
                    emit(
                        &self.events,
                        AgentEvent::ReasoningDelta {
                            session_id: session_id.clone(),
                            delta,
                        },
                    );
                }
                Some(StreamEvent::ToolCallEnd { tool_call }) => message.push_tool_call(tool_call),
                Some(StreamEvent::Done {
                    finish_reason,
                    usage: u,
                }) => {
                    usage = u;
                    finish = Some(finish_reason);
                }
                Some(StreamEvent::Error { error }) => break Err(error.into()),
                Some(_) => {}
                None if finish.is_some() => break Ok(()),
                None => {
                    break Err(GatewayError::StreamInterrupted(
                        "stream ended without a finish event".into(),
                    )
                    .into())
                }
            }
        };

        let cost = provider.pricing().cost(&usage);
        if cost > 0.0 {
            self.sessions.add_cost(session_id, cost)?;
        }

        if let Err(e) = outcome {
            message.finish_reason = Some(if e.is_cancelled() {
                FinishReason::Cancelled
            } else {
                FinishReason::Error
            });
            if let Err(save_err) = self.messages.save(&message) {
                warn!(error = %save_err, "failed to save partial assistant message");
            }
            return Err(e);
        }

        message.finish_reason = finish;
        self.messages.save(&message)?;
        Ok(TurnOutput {
            message,
            usage,
            cost,
        })
    }

    /// Replace the session's effective history with a small-model summary and
    /// re-issue the original request.
    async fn summarize_and_resume(
        &self,
        session_id: &SessionId,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<(TokenUsage, f64), EngineError> {
        self.status.set(session_id, RunState::Summarizing);
        emit(
            &self.events,
            AgentEvent::SummarizeStart {
                session_id: session_id.clone(),
            },
        );

        let session = self.load_session(session_id)?;
        let history = self.history(&session)?;
        let summary_prompt = summarize::build_summary_prompt(&history, &session.todos);

        let small = self.slots.small();
        let (summary, usage) = summarize::summarize(
            small.as_ref(),
            session_id,
            summary_prompt,
            &self.config.summary_options,
            cancel,
        )
        .await
        .map_err(|e| match e {
            GatewayError::Cancelled => EngineError::RequestCancelled,
            other => EngineError::Gateway(other),
        })?;

        let cost = small.pricing().cost(&usage);
        if cost > 0.0 {
            self.sessions.add_cost(session_id, cost)?;
        }

        let mut message = Message::assistant(session_id.clone(), small.name(), small.model());
        message.is_summary_message = true;
        message.append_text_delta(&summary);
        message.finish_reason = Some(FinishReason::EndTurn);
        let message = self.messages.create(&message)?;

        let mut session = self.load_session(session_id)?;
        session.summary_message_id = Some(message.id.clone());
        self.sessions.save(&session)?;

        self.messages.create(&Message::user_text(
            session_id.clone(),
            summarize::resume_prompt(prompt),
        ))?;

        info!(summary_chars = summary.len(), "history summarized");
        emit(
            &self.events,
            AgentEvent::SummarizeComplete {
                session_id: session_id.clone(),
                summary_chars: summary.len(),
            },
        );
        self.status.set(session_id, RunState::Thinking);
        Ok((usage, cost))
    }

    fn apply_pending_models(&self) {
        match self.slots.apply_pending() {
            Ok(Some(update)) => emit(
                &self.events,
                AgentEvent::ModelSwitched {
                    model_type: update.model_type,
                    model: update.model,
                },
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "keeping current model"),
        }
    }

    fn load_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        self.sessions.get(session_id).map_err(|e| {
            if e.is_not_found() {
                EngineError::SessionMissing(session_id.to_string())
            } else {
                EngineError::Store(e)
            }
        })
    }

    /// Messages sent to the model. History before the summary message is
    /// dropped and the summary itself is presented as user context.
    fn history(&self, session: &Session) -> Result<Vec<Message>, EngineError> {
        let mut all = self.messages.list(&session.id)?;
        if let Some(summary_id) = &session.summary_message_id {
            match all.iter().position(|m| &m.id == summary_id) {
                Some(pos) => {
                    all.drain(..pos);
                    all[0].role = Role::User;
                }
                None => warn!(summary_id = %summary_id, "summary message not found"),
            }
        }
        Ok(all.into_iter().filter_map(sanitize).collect())
    }
}

/// Interrupted assistant messages keep their text but lose tool calls that
/// never ran.
fn sanitize(mut message: Message) -> Option<Message> {
    let interrupted = matches!(
        message.finish_reason,
        Some(FinishReason::Cancelled | FinishReason::Error)
    );
    if message.role == Role::Assistant && interrupted {
        message
            .parts
            .retain(|p| !matches!(p, ContentPart::ToolCall(_)));
    }
    (!message.is_empty()).then_some(message)
}
