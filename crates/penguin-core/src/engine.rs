// The reason/act engine
//
// Drives one agent's loop: materialize the API view, stream the provider,
// collect tool invocations, dispatch them, inject results, and terminate
// on explicit finish signals, trivial-response runs, cancellation, or the
// iteration cap. One engine invocation per agent at a time; the caller
// serializes (see the core façade's per-agent run lock).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::conversation::Conversation;
use crate::error::{CoreError, Result};
use crate::executor::PauseGate;
use crate::message::{Message, MessageCategory, MessageContent, MessageRole};
use crate::parser::{parse_finish_status, ActionKind, FinishStatus, Segment};
use crate::provider::{
    backoff_delay, ChunkStream, ModelBinding, ProviderRegistry, PROVIDER_RETRY_ATTEMPTS,
};
use crate::streaming::{
    CompletionReason, ProviderChunk, StreamEvent, StreamingStateManager, TokenUsage,
    ToolCallRecord,
};
use crate::tools::{ToolContext, ToolDispatcher, ToolResult};

/// Which entry point is driving the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One user input to one finalized response
    Response,
    /// Autonomous task: iterate until an explicit or implicit stop
    Task,
}

/// The engine's view of one agent
#[derive(Clone)]
pub struct AgentHandle {
    pub id: String,
    pub binding: ModelBinding,
    pub conversation: Arc<RwLock<Conversation>>,
}

/// Per-run options
#[derive(Clone)]
pub struct EngineOptions {
    /// Override the configured iteration cap
    pub max_iterations: Option<usize>,
    pub cancel: CancellationToken,
    pub pause: PauseGate,
    /// Wall-clock budget for task mode (None = unbounded)
    pub wall_clock: Option<Duration>,
    /// Stream events are forwarded here when set
    pub events: Option<UnboundedSender<StreamEvent>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_iterations: None,
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
            wall_clock: None,
            events: None,
        }
    }
}

/// The outcome of a run
#[derive(Debug, Clone)]
pub struct EngineResult {
    /// Final assistant text (last substantive response)
    pub text: String,
    /// Tool results in dispatch order across all iterations
    pub tool_results: Vec<ToolResult>,
    pub iterations: usize,
    pub completion_reason: CompletionReason,
    pub usage: TokenUsage,
    /// Status parsed from finish_task, when present
    pub finish_status: Option<FinishStatus>,
    /// finish_task leaves the task awaiting human review
    pub pending_human_review: bool,
    /// Snapshots created during the run (filled by the façade)
    pub snapshot_ids: Vec<String>,
}

/// What one iteration concluded
enum IterationOutcome {
    Continue,
    Terminate(CompletionReason),
}

/// The reason/act loop driver
pub struct Engine {
    config: EngineConfig,
    providers: Arc<ProviderRegistry>,
    dispatcher: ToolDispatcher,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        providers: Arc<ProviderRegistry>,
        dispatcher: ToolDispatcher,
    ) -> Self {
        Self {
            config,
            providers,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Process one user input to a single finalized assistant response
    pub async fn run_response(
        &self,
        agent: &AgentHandle,
        user_input: &str,
        opts: EngineOptions,
    ) -> Result<EngineResult> {
        self.run_loop(agent, user_input, RunMode::Response, opts)
            .await
    }

    /// Run an autonomous task to completion, error, cap, or cancellation
    pub async fn run_task(
        &self,
        agent: &AgentHandle,
        task: &str,
        opts: EngineOptions,
    ) -> Result<EngineResult> {
        self.run_loop(agent, task, RunMode::Task, opts).await
    }

    async fn run_loop(
        &self,
        agent: &AgentHandle,
        input: &str,
        mode: RunMode,
        opts: EngineOptions,
    ) -> Result<EngineResult> {
        let max_iterations = opts.max_iterations.unwrap_or(match mode {
            RunMode::Response => self.config.max_response_iterations,
            RunMode::Task => self.config.max_task_iterations,
        });
        let wall_deadline = opts.wall_clock.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::hours(1)));

        let mut result = EngineResult {
            text: String::new(),
            tool_results: Vec::new(),
            iterations: 0,
            completion_reason: CompletionReason::IterationCap,
            usage: TokenUsage::default(),
            finish_status: None,
            pending_human_review: false,
            snapshot_ids: Vec::new(),
        };
        let mut trivial_run = 0usize;

        if !input.trim().is_empty() {
            agent
                .conversation
                .write()
                .await
                .add_message(Message::user(input));
        }

        for i in 1..=max_iterations {
            result.iterations = i;

            // Suspension point: honor pause and cancellation between steps
            opts.pause.wait_if_paused().await;
            if opts.cancel.is_cancelled() {
                result.completion_reason = CompletionReason::Cancelled;
                return Ok(result);
            }
            if let Some(deadline) = wall_deadline {
                if Utc::now() >= deadline {
                    info!(agent_id = %agent.id, "task wall clock expired");
                    result.completion_reason = CompletionReason::IterationCap;
                    return Ok(result);
                }
            }

            let outcome = self
                .run_iteration(
                    agent,
                    mode,
                    i,
                    wall_deadline,
                    &opts,
                    &mut result,
                    &mut trivial_run,
                )
                .await?;

            match outcome {
                IterationOutcome::Terminate(reason) => {
                    result.completion_reason = reason;
                    return Ok(result);
                }
                IterationOutcome::Continue => {
                    if i == max_iterations {
                        warn!(agent_id = %agent.id, max_iterations, "iteration cap reached");
                        result.completion_reason = CompletionReason::IterationCap;
                        return Ok(result);
                    }
                    if mode == RunMode::Task {
                        agent
                            .conversation
                            .write()
                            .await
                            .add_message(Message::user(self.config.continuation_prompt.clone()));
                    }
                }
            }
        }

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        agent: &AgentHandle,
        mode: RunMode,
        iteration: usize,
        wall_deadline: Option<chrono::DateTime<Utc>>,
        opts: &EngineOptions,
        result: &mut EngineResult,
        trivial_run: &mut usize,
    ) -> Result<IterationOutcome> {
        let api_view = agent.conversation.read().await.api_view();
        let session_id = agent.conversation.read().await.session().id;

        // Open the provider stream, retrying retryable failures
        let stream = match self.open_with_retry(agent, api_view, opts).await? {
            OpenOutcome::Opened(stream) => stream,
            OpenOutcome::Cancelled => {
                return Ok(IterationOutcome::Terminate(CompletionReason::Cancelled));
            }
            OpenOutcome::Exhausted => {
                // Retries exhausted: describe the failure to the log and
                // the conversation, then terminate with an error reason.
                agent.conversation.write().await.add_message(Message::assistant(
                    "The model provider could not be reached after repeated attempts.",
                ));
                return Ok(IterationOutcome::Terminate(CompletionReason::Error));
            }
        };

        let mut mgr = StreamingStateManager::new(&agent.id);
        let drive = self.drive_stream(&mut mgr, stream, opts).await;

        match drive {
            StreamEnd::Cancelled => {
                self.append_assistant(agent, &mgr, result).await;
                self.emit(opts, mgr.finish(CompletionReason::Cancelled));
                return Ok(IterationOutcome::Terminate(CompletionReason::Cancelled));
            }
            StreamEnd::Failed(error) => {
                let partial = mgr.text();
                let note = if partial.is_empty() {
                    format!("The provider stream failed: {}", error)
                } else {
                    format!(
                        "{}\n\n[The provider stream failed before completing: {}]",
                        partial, error
                    )
                };
                agent
                    .conversation
                    .write()
                    .await
                    .add_message(Message::assistant(note));
                return Ok(IterationOutcome::Terminate(CompletionReason::Error));
            }
            StreamEnd::Completed => {}
        }

        // Commit any bytes still in the coalescing buffer so the observed
        // tool calls and action tags are complete before dispatch
        self.emit(opts, mgr.flush_pending());

        result.usage.merge(mgr.usage());

        // Append the assistant message with its structured tool calls
        self.append_assistant(agent, &mgr, result).await;

        // Dispatch observed tool calls in stream order
        let records: Vec<ToolCallRecord> = mgr.tool_calls().to_vec();
        let mut dispatched = 0usize;
        for record in records {
            opts.pause.wait_if_paused().await;
            if opts.cancel.is_cancelled() {
                self.emit(opts, mgr.finish(CompletionReason::Cancelled));
                return Ok(IterationOutcome::Terminate(CompletionReason::Cancelled));
            }

            let ctx = ToolContext {
                agent_id: agent.id.clone(),
                session_id,
                iteration,
                deadline: wall_deadline.unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1)),
                cancel: opts.cancel.clone(),
            };
            let tool_result = self
                .dispatcher
                .dispatch_tool(&record.name, &record.payload, &ctx)
                .await;

            self.emit(opts, mgr.tool_completed(&record.id, tool_result.clone()));

            let summary = if tool_result.ok {
                tool_result.output.clone()
            } else {
                format!(
                    "Tool '{}' failed: {}",
                    tool_result.tool_name, tool_result.output
                )
            };
            let mut message = Message::tool_result(record.id.clone(), tool_result.ok, summary);
            message
                .metadata
                .insert("tool_name".to_string(), json!(tool_result.tool_name));
            agent.conversation.write().await.add_message(message);

            result.tool_results.push(tool_result);
            dispatched += 1;
        }

        // Budget check: add() trims synchronously; if the session is still
        // over, make one aggressive pass, then give up.
        {
            let mut conversation = agent.conversation.write().await;
            if conversation.over_budget() {
                conversation.aggressive_trim();
                if conversation.over_budget() {
                    let tokens = conversation.token_total();
                    let budget = conversation.window().config().available();
                    drop(conversation);
                    self.emit(opts, mgr.finish(CompletionReason::Error));
                    return Err(CoreError::ContextWindowExceeded {
                        agent_id: agent.id.clone(),
                        tokens,
                        budget,
                    });
                }
            }
        }

        // Termination signals from the produced content
        let text = mgr.text();
        let actions = mgr.actions();
        let finish_response = actions
            .iter()
            .any(|t| t.kind == ActionKind::FinishResponse);
        let finish_task = actions
            .iter()
            .find(|t| t.kind == ActionKind::FinishTask)
            .map(|t| parse_finish_status(&t.payload));

        if mode == RunMode::Response && finish_response {
            self.emit(opts, mgr.finish(CompletionReason::Normal));
            return Ok(IterationOutcome::Terminate(CompletionReason::Normal));
        }

        if mode == RunMode::Task {
            if let Some(status) = finish_task {
                result.finish_status = Some(status);
                result.pending_human_review = true;
                info!(agent_id = %agent.id, status = ?status, "task signalled completion; pending human review");
                self.emit(opts, mgr.finish(CompletionReason::ToolExit));
                return Ok(IterationOutcome::Terminate(CompletionReason::ToolExit));
            }
        }

        // Trivial-response accounting: short content with no fresh tool
        // results and no explicit completion counts toward the limit.
        let stripped = strip_action_tags(&text);
        if stripped.trim().len() < self.config.trivial_length
            && dispatched == 0
            && !finish_response
            && finish_task.is_none()
        {
            *trivial_run += 1;
            if *trivial_run >= self.config.trivial_run_limit {
                info!(agent_id = %agent.id, "trivial response run; implicit completion");
                self.emit(opts, mgr.finish(CompletionReason::ImplicitCompletion));
                return Ok(IterationOutcome::Terminate(
                    CompletionReason::ImplicitCompletion,
                ));
            }
        } else {
            *trivial_run = 0;
        }

        // Response mode with no tool activity is complete after one pass
        if mode == RunMode::Response && dispatched == 0 {
            self.emit(opts, mgr.finish(CompletionReason::Normal));
            return Ok(IterationOutcome::Terminate(CompletionReason::Normal));
        }

        self.emit(opts, mgr.finish(CompletionReason::Normal));
        Ok(IterationOutcome::Continue)
    }

    /// Open the provider stream with bounded retries for retryable errors
    async fn open_with_retry(
        &self,
        agent: &AgentHandle,
        api_view: Vec<crate::provider::ApiMessage>,
        opts: &EngineOptions,
    ) -> Result<OpenOutcome> {
        let adapter = self
            .providers
            .get(&agent.binding.provider)
            .ok_or_else(|| {
                CoreError::provider(format!("no adapter for provider '{}'", agent.binding.provider))
            })?;

        let mut attempt = 0u32;
        loop {
            let open = tokio::time::timeout(
                self.config.connect_timeout,
                adapter.open_stream(api_view.clone(), &agent.binding),
            )
            .await;

            match open {
                Ok(Ok(stream)) => return Ok(OpenOutcome::Opened(stream)),
                Ok(Err(err)) if err.kind == crate::provider::ProviderErrorKind::Auth => {
                    return Err(CoreError::ProviderAuth(err.message));
                }
                Ok(Err(err)) if !err.retryable() => {
                    return Err(CoreError::provider(err.message));
                }
                Ok(Err(err)) => {
                    warn!(agent_id = %agent.id, attempt, error = %err, "provider open failed; retrying");
                }
                Err(_) => {
                    warn!(agent_id = %agent.id, attempt, "provider connect timeout; retrying");
                }
            }

            attempt += 1;
            if attempt >= PROVIDER_RETRY_ATTEMPTS {
                return Ok(OpenOutcome::Exhausted);
            }

            let delay = backoff_delay(attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = opts.cancel.cancelled() => return Ok(OpenOutcome::Cancelled),
            }
        }
    }

    /// Pump the chunk stream into the state manager until it closes
    async fn drive_stream(
        &self,
        mgr: &mut StreamingStateManager,
        mut stream: ChunkStream,
        opts: &EngineOptions,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = opts.cancel.cancelled() => return StreamEnd::Cancelled,
                next = tokio::time::timeout(self.config.idle_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    let error = "idle timeout waiting for provider chunk".to_string();
                    self.emit(opts, mgr.fail(error.clone()));
                    return StreamEnd::Failed(error);
                }
                Ok(None) => return StreamEnd::Completed,
                Ok(Some(ProviderChunk::End)) => return StreamEnd::Completed,
                Ok(Some(ProviderChunk::Error(error))) => {
                    self.emit(opts, mgr.fail(error.clone()));
                    return StreamEnd::Failed(error);
                }
                Ok(Some(chunk)) => {
                    let events = mgr.feed(chunk);
                    self.emit(opts, events);
                }
            }
        }
    }

    /// Append the finalized assistant message (text + tool call records)
    async fn append_assistant(
        &self,
        agent: &AgentHandle,
        mgr: &StreamingStateManager,
        result: &mut EngineResult,
    ) {
        let text = mgr.text();
        let records = mgr.tool_calls();
        if text.is_empty() && records.is_empty() {
            return;
        }

        let mut message = Message::new(
            MessageRole::Assistant,
            MessageContent::Text(text.clone()),
            MessageCategory::Conversation,
        );
        if !records.is_empty() {
            message.metadata.insert(
                "tool_calls".to_string(),
                serde_json::to_value(records).unwrap_or(Value::Null),
            );
        }
        if !mgr.reasoning().is_empty() {
            message
                .metadata
                .insert("reasoning".to_string(), json!(mgr.reasoning()));
        }
        agent.conversation.write().await.add_message(message);

        let stripped = strip_action_tags(&text);
        if !stripped.trim().is_empty() {
            result.text = stripped;
        }
    }

    fn emit(&self, opts: &EngineOptions, events: Vec<StreamEvent>) {
        if let Some(tx) = &opts.events {
            for event in events {
                let _ = tx.send(event);
            }
        }
    }
}

/// Outcome of pumping one provider stream
enum StreamEnd {
    Completed,
    Cancelled,
    Failed(String),
}

/// Outcome of opening a provider stream
enum OpenOutcome {
    Opened(ChunkStream),
    Cancelled,
    Exhausted,
}

/// Drop action tags from assistant text, keeping the narration
pub fn strip_action_tags(text: &str) -> String {
    crate::parser::parse(text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Text(t) => Some(t),
            _ => None,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
