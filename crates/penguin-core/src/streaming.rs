// Streaming state manager
//
// Consumes provider chunks (text, reasoning, tool-call deltas) and emits
// coalesced, ordered events with at most one terminal event per logical
// message. Tool invocations arriving as provider deltas and tool tags
// completed inside the buffered text surface through the same events.
//
// Single-writer: one provider stream feeds one manager. Consumers fan out
// on the emitted events but never write back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::parser::{extract_actions, ActionTag};
use crate::tools::ToolResult;

/// Why a logical message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Normal,
    ToolExit,
    Cancelled,
    Error,
    IterationCap,
    ImplicitCompletion,
}

/// Aggregate token usage reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl TokenUsage {
    /// Fold another usage report into this one
    pub fn merge(&mut self, other: &TokenUsage) {
        fn add(a: &mut Option<u32>, b: Option<u32>) {
            if let Some(v) = b {
                *a = Some(a.unwrap_or(0) + v);
            }
        }
        add(&mut self.prompt_tokens, other.prompt_tokens);
        add(&mut self.completion_tokens, other.completion_tokens);
        add(&mut self.total_tokens, other.total_tokens);
    }
}

/// One chunk from a provider adapter
#[derive(Debug, Clone)]
pub enum ProviderChunk {
    /// Incremental assistant text
    TextDelta(String),
    /// Incremental reasoning text (separate channel, never mixed into text)
    ReasoningDelta(String),
    /// Provider-native tool call fragment
    ToolCallDelta {
        id: String,
        name: String,
        args_fragment: String,
    },
    /// Usage report (may arrive at any point)
    Usage(TokenUsage),
    /// Provider closed the stream normally
    End,
    /// Unrecoverable provider error
    Error(String),
}

/// A tool call observed during the stream, with its eventual result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

/// Events emitted to consumers. Serialized as `{ event, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    #[serde(rename = "stream.started")]
    Started {
        message_id: Uuid,
        role: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "stream.text.delta")]
    TextDelta { message_id: Uuid, delta: String },

    #[serde(rename = "stream.reasoning.delta")]
    ReasoningDelta { message_id: Uuid, delta: String },

    #[serde(rename = "stream.tool.started")]
    ToolStarted {
        message_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        payload: String,
    },

    #[serde(rename = "stream.tool.completed")]
    ToolCompleted {
        message_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
    },

    #[serde(rename = "stream.finalized")]
    Finalized {
        message_id: Uuid,
        text: String,
        reasoning: String,
        tool_calls: Vec<ToolCallRecord>,
        usage: TokenUsage,
        completion_reason: CompletionReason,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "stream.error")]
    Error {
        message_id: Uuid,
        kind: String,
        partial_text: String,
    },
}

impl StreamEvent {
    /// The SSE event name for this event
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Started { .. } => "stream.started",
            StreamEvent::TextDelta { .. } => "stream.text.delta",
            StreamEvent::ReasoningDelta { .. } => "stream.reasoning.delta",
            StreamEvent::ToolStarted { .. } => "stream.tool.started",
            StreamEvent::ToolCompleted { .. } => "stream.tool.completed",
            StreamEvent::Finalized { .. } => "stream.finalized",
            StreamEvent::Error { .. } => "stream.error",
        }
    }
}

/// Manager states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    ToolCalling,
    Finalizing,
    Error,
}

/// Coalescing knobs
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Deltas buffered at most this long before a flush
    pub coalesce_window: Duration,
    /// A flush fires as soon as this many bytes are pending
    pub coalesce_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(50),
            coalesce_bytes: 512,
        }
    }
}

/// The streaming state machine for one logical assistant message
pub struct StreamingStateManager {
    config: StreamConfig,
    state: StreamState,
    message_id: Uuid,
    agent_id: String,

    text: String,
    reasoning: String,
    pending_text: String,
    pending_reasoning: String,
    last_flush: Instant,

    tool_calls: Vec<ToolCallRecord>,
    /// Count of action tags already surfaced as tool events
    actions_seen: usize,
    usage: TokenUsage,
    started_emitted: bool,
    terminal_emitted: bool,
}

impl StreamingStateManager {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::with_config(agent_id, StreamConfig::default())
    }

    pub fn with_config(agent_id: impl Into<String>, config: StreamConfig) -> Self {
        Self {
            config,
            state: StreamState::Idle,
            message_id: Uuid::now_v7(),
            agent_id: agent_id.into(),
            text: String::new(),
            reasoning: String::new(),
            pending_text: String::new(),
            pending_reasoning: String::new(),
            last_flush: Instant::now(),
            tool_calls: Vec::new(),
            actions_seen: 0,
            usage: TokenUsage::default(),
            started_emitted: false,
            terminal_emitted: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Full text accumulated so far (committed + pending)
    pub fn text(&self) -> String {
        let mut out = self.text.clone();
        out.push_str(&self.pending_text);
        out
    }

    /// Full reasoning accumulated so far
    pub fn reasoning(&self) -> String {
        let mut out = self.reasoning.clone();
        out.push_str(&self.pending_reasoning);
        out
    }

    /// Completed action tags observed in the buffered text
    pub fn actions(&self) -> Vec<ActionTag> {
        extract_actions(&self.text())
    }

    /// Tool calls observed so far (provider deltas and text tags)
    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    /// Usage reported by the provider so far
    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    /// Feed one provider chunk; returns the events it produced, in order
    pub fn feed(&mut self, chunk: ProviderChunk) -> Vec<StreamEvent> {
        if self.terminal_emitted {
            debug!(message_id = %self.message_id, "chunk after terminal event dropped");
            return Vec::new();
        }

        let mut events = Vec::new();

        match chunk {
            ProviderChunk::TextDelta(delta) => {
                if delta.is_empty() {
                    return events;
                }
                self.ensure_started(&mut events);
                self.pending_text.push_str(&delta);
                self.maybe_flush(&mut events);
                self.surface_new_actions(&mut events);
            }
            ProviderChunk::ReasoningDelta(delta) => {
                if delta.is_empty() {
                    return events;
                }
                self.ensure_started(&mut events);
                self.pending_reasoning.push_str(&delta);
                self.maybe_flush(&mut events);
            }
            ProviderChunk::ToolCallDelta {
                id,
                name,
                args_fragment,
            } => {
                self.ensure_started(&mut events);
                // Deltas must land in stream order relative to text
                self.flush(&mut events);
                self.state = StreamState::ToolCalling;
                match self.tool_calls.iter().position(|r| r.id == id) {
                    Some(pos) => self.tool_calls[pos].payload.push_str(&args_fragment),
                    None => {
                        self.tool_calls.push(ToolCallRecord {
                            id: id.clone(),
                            name: name.clone(),
                            payload: args_fragment.clone(),
                            result: None,
                        });
                        events.push(StreamEvent::ToolStarted {
                            message_id: self.message_id,
                            tool_call_id: id,
                            tool_name: name,
                            payload: args_fragment,
                        });
                    }
                }
            }
            ProviderChunk::Usage(usage) => {
                self.usage.merge(&usage);
            }
            ProviderChunk::End => {
                return self.finish(CompletionReason::Normal);
            }
            ProviderChunk::Error(message) => {
                return self.fail(message);
            }
        }

        events
    }

    /// Flush pending buffers and surface any newly completed action tags
    /// without finalizing. The engine calls this when the provider closes,
    /// before dispatching tools against the observed calls.
    pub fn flush_pending(&mut self) -> Vec<StreamEvent> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.flush(&mut events);
        self.surface_new_actions(&mut events);
        events
    }

    /// Record the result of a dispatched tool call and emit its event
    pub fn tool_completed(&mut self, tool_call_id: &str, result: ToolResult) -> Vec<StreamEvent> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let tool_name = result.tool_name.clone();
        if let Some(record) = self.tool_calls.iter_mut().find(|r| r.id == tool_call_id) {
            record.result = Some(result.clone());
        }
        if self.state == StreamState::ToolCalling {
            self.state = StreamState::Streaming;
        }
        vec![StreamEvent::ToolCompleted {
            message_id: self.message_id,
            tool_call_id: tool_call_id.to_string(),
            tool_name,
            result,
        }]
    }

    /// Flush buffers and emit the single finalize event
    pub fn finish(&mut self, reason: CompletionReason) -> Vec<StreamEvent> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.state = StreamState::Finalizing;
        self.flush(&mut events);
        self.surface_new_actions(&mut events);
        self.terminal_emitted = true;
        events.push(StreamEvent::Finalized {
            message_id: self.message_id,
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            usage: self.usage.clone(),
            completion_reason: reason,
            timestamp: Utc::now(),
        });
        self.state = StreamState::Idle;
        events
    }

    /// Emit the error terminal with the partial buffer. No finalize follows.
    pub fn fail(&mut self, kind: impl Into<String>) -> Vec<StreamEvent> {
        if self.terminal_emitted {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.flush(&mut events);
        self.terminal_emitted = true;
        self.state = StreamState::Error;
        events.push(StreamEvent::Error {
            message_id: self.message_id,
            kind: kind.into(),
            partial_text: self.text.clone(),
        });
        events
    }

    /// Whether a terminal event has been emitted
    pub fn is_terminal(&self) -> bool {
        self.terminal_emitted
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started_emitted {
            self.started_emitted = true;
            self.state = StreamState::Streaming;
            events.push(StreamEvent::Started {
                message_id: self.message_id,
                role: "assistant".to_string(),
                agent_id: self.agent_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    fn maybe_flush(&mut self, events: &mut Vec<StreamEvent>) {
        let pending = self.pending_text.len() + self.pending_reasoning.len();
        if pending >= self.config.coalesce_bytes
            || self.last_flush.elapsed() >= self.config.coalesce_window
        {
            self.flush(events);
        }
    }

    /// Move pending bytes into the committed buffers, emitting one delta
    /// per non-empty channel. Never drops or reorders bytes.
    fn flush(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.pending_text.is_empty() {
            let delta = std::mem::take(&mut self.pending_text);
            self.text.push_str(&delta);
            events.push(StreamEvent::TextDelta {
                message_id: self.message_id,
                delta,
            });
        }
        if !self.pending_reasoning.is_empty() {
            let delta = std::mem::take(&mut self.pending_reasoning);
            self.reasoning.push_str(&delta);
            events.push(StreamEvent::ReasoningDelta {
                message_id: self.message_id,
                delta,
            });
        }
        self.last_flush = Instant::now();
    }

    /// Emit tool.started for action tags newly completed in the committed
    /// text. Uses the same event path as provider tool-call deltas.
    fn surface_new_actions(&mut self, events: &mut Vec<StreamEvent>) {
        let actions = extract_actions(&self.text);
        for tag in actions.iter().skip(self.actions_seen) {
            if tag.kind.is_finish_signal() {
                continue;
            }
            let Some(tool_name) = tag.kind.tool_name() else {
                continue;
            };
            let call_id = format!("tag_{}", Uuid::now_v7().simple());
            self.state = StreamState::ToolCalling;
            self.tool_calls.push(ToolCallRecord {
                id: call_id.clone(),
                name: tool_name.to_string(),
                payload: tag.payload.clone(),
                result: None,
            });
            events.push(StreamEvent::ToolStarted {
                message_id: self.message_id,
                tool_call_id: call_id,
                tool_name: tool_name.to_string(),
                payload: tag.payload.clone(),
            });
        }
        self.actions_seen = actions.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eager_config() -> StreamConfig {
        // Flush on every byte so tests see deltas immediately
        StreamConfig {
            coalesce_window: Duration::from_millis(0),
            coalesce_bytes: 1,
        }
    }

    #[test]
    fn test_started_precedes_deltas() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        let events = mgr.feed(ProviderChunk::TextDelta("Hello".into()));
        assert_eq!(events[0].name(), "stream.started");
        assert_eq!(events[1].name(), "stream.text.delta");
    }

    #[test]
    fn test_exactly_one_finalize() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::TextDelta("Hi".into()));
        let first = mgr.finish(CompletionReason::Normal);
        assert!(first.iter().any(|e| e.name() == "stream.finalized"));
        assert!(mgr.finish(CompletionReason::Normal).is_empty());
        assert!(mgr.feed(ProviderChunk::TextDelta("late".into())).is_empty());
    }

    #[test]
    fn test_no_finalize_after_error() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::TextDelta("partial".into()));
        let events = mgr.feed(ProviderChunk::Error("connection reset".into()));
        let last = events.last().unwrap();
        assert_eq!(last.name(), "stream.error");
        match last {
            StreamEvent::Error { partial_text, .. } => assert_eq!(partial_text, "partial"),
            _ => unreachable!(),
        }
        assert!(mgr.finish(CompletionReason::Normal).is_empty());
    }

    #[test]
    fn test_reasoning_kept_on_separate_channel() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::ReasoningDelta("thinking...".into()));
        mgr.feed(ProviderChunk::TextDelta("answer".into()));
        let events = mgr.finish(CompletionReason::Normal);
        match events.last().unwrap() {
            StreamEvent::Finalized {
                text, reasoning, ..
            } => {
                assert_eq!(text, "answer");
                assert_eq!(reasoning, "thinking...");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_coalescing_defers_but_never_drops() {
        let config = StreamConfig {
            coalesce_window: Duration::from_secs(3600),
            coalesce_bytes: 1024,
        };
        let mut mgr = StreamingStateManager::with_config("default", config);
        let mut deltas = 0;
        for _ in 0..10 {
            let events = mgr.feed(ProviderChunk::TextDelta("abc".into()));
            deltas += events
                .iter()
                .filter(|e| e.name() == "stream.text.delta")
                .count();
        }
        // Nothing flushed yet: below both thresholds
        assert_eq!(deltas, 0);
        // Finish flushes everything before the terminal event
        let events = mgr.finish(CompletionReason::Normal);
        assert_eq!(events[0].name(), "stream.text.delta");
        match &events[0] {
            StreamEvent::TextDelta { delta, .. } => assert_eq!(delta.len(), 30),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_byte_threshold_triggers_flush() {
        let config = StreamConfig {
            coalesce_window: Duration::from_secs(3600),
            coalesce_bytes: 4,
        };
        let mut mgr = StreamingStateManager::with_config("default", config);
        let events = mgr.feed(ProviderChunk::TextDelta("abcdef".into()));
        assert!(events.iter().any(|e| e.name() == "stream.text.delta"));
    }

    #[test]
    fn test_action_tag_surfaces_tool_started() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::TextDelta("<execute>print".into()));
        // Tag not complete yet: no tool event
        assert!(mgr.tool_calls().is_empty());
        let events = mgr.feed(ProviderChunk::TextDelta("(1)</execute>".into()));
        let started: Vec<_> = events
            .iter()
            .filter(|e| e.name() == "stream.tool.started")
            .collect();
        assert_eq!(started.len(), 1);
        match started[0] {
            StreamEvent::ToolStarted {
                tool_name, payload, ..
            } => {
                assert_eq!(tool_name, "code_execution");
                assert_eq!(payload, "print(1)");
            }
            _ => unreachable!(),
        }
        assert_eq!(mgr.state(), StreamState::ToolCalling);
    }

    #[test]
    fn test_provider_tool_delta_same_event_path() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        let events = mgr.feed(ProviderChunk::ToolCallDelta {
            id: "call_1".into(),
            name: "web_search".into(),
            args_fragment: "{\"q\":".into(),
        });
        assert!(events.iter().any(|e| e.name() == "stream.tool.started"));
        // Later fragments accumulate without a second started event
        let events = mgr.feed(ProviderChunk::ToolCallDelta {
            id: "call_1".into(),
            name: "web_search".into(),
            args_fragment: "\"rust\"}".into(),
        });
        assert!(!events.iter().any(|e| e.name() == "stream.tool.started"));
        assert_eq!(mgr.tool_calls()[0].payload, "{\"q\":\"rust\"}");
    }

    #[test]
    fn test_tool_completed_returns_to_streaming() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::TextDelta("<search>q:3</search>".into()));
        let id = mgr.tool_calls()[0].id.clone();
        let result = ToolResult {
            ok: true,
            output: "3 hits".into(),
            error: None,
            duration_ms: 5,
            tool_name: "pattern_search".into(),
        };
        let events = mgr.tool_completed(&id, result);
        assert_eq!(events[0].name(), "stream.tool.completed");
        assert_eq!(mgr.state(), StreamState::Streaming);
        assert!(mgr.tool_calls()[0].result.is_some());
    }

    #[test]
    fn test_finish_tags_do_not_become_tool_events() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        let events = mgr.feed(ProviderChunk::TextDelta(
            "done <finish_response></finish_response>".into(),
        ));
        assert!(!events.iter().any(|e| e.name() == "stream.tool.started"));
        assert_eq!(mgr.actions().len(), 1);
    }

    #[test]
    fn test_flush_pending_surfaces_buffered_tags() {
        let config = StreamConfig {
            coalesce_window: Duration::from_secs(3600),
            coalesce_bytes: 1024,
        };
        let mut mgr = StreamingStateManager::with_config("default", config);
        mgr.feed(ProviderChunk::TextDelta("<search>q:3</search>".into()));
        // Still below both coalescing thresholds: nothing surfaced yet
        assert!(mgr.tool_calls().is_empty());

        let events = mgr.flush_pending();
        assert!(events.iter().any(|e| e.name() == "stream.text.delta"));
        assert!(events.iter().any(|e| e.name() == "stream.tool.started"));
        assert_eq!(mgr.tool_calls().len(), 1);
    }

    #[test]
    fn test_usage_merged_into_finalize() {
        let mut mgr = StreamingStateManager::with_config("default", eager_config());
        mgr.feed(ProviderChunk::TextDelta("hi".into()));
        mgr.feed(ProviderChunk::Usage(TokenUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            total_tokens: Some(15),
        }));
        let events = mgr.feed(ProviderChunk::End);
        match events.last().unwrap() {
            StreamEvent::Finalized { usage, .. } => {
                assert_eq!(usage.total_tokens, Some(15));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = StreamEvent::TextDelta {
            message_id: Uuid::now_v7(),
            delta: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stream.text.delta");
        assert_eq!(json["data"]["delta"], "hi");
    }
}
