// The core façade
//
// Composition root: owns the agent registry, the executor, the message
// bus, the tool registry, the snapshot store, and the health monitor, and
// exposes the operations the external interface layer calls. The default
// agent is created at startup and cannot be deleted.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{AgentProfile, AgentRegistry, ExecutionState};
use crate::bus::{
    AgentDeliverySink, BusMessage, BusMessageKind, MessageBus, SubscriptionFilter,
    SubscriptionHandle, HUMAN_RECIPIENT,
};
use crate::config::CoreConfig;
use crate::engine::{Engine, EngineOptions, EngineResult};
use crate::error::{CoreError, Result};
use crate::executor::{AgentExecutor, AgentTask, TaskControl, TaskRunner};
use crate::health::{AgentCapacity, HealthMonitor, HealthReport};
use crate::message::{Message, MessageCategory, MessageContent, MessageRole};
use crate::provider::{ModelBinding, ProviderAdapter, ProviderRegistry};
use crate::snapshots::{
    MemorySessionIndex, MemorySnapshotStore, SessionIndex, SessionRecord, SnapshotDescriptor,
    SnapshotMeta, SnapshotStore,
};
use crate::streaming::StreamEvent;
use crate::tools::{Tool, ToolContext, ToolDispatcher, ToolOutcome, ToolRegistry, ToolSpec};

/// Builder for the core façade
pub struct CoreBuilder {
    config: CoreConfig,
    default_binding: ModelBinding,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    sessions: Option<Arc<dyn SessionIndex>>,
    providers: Vec<(String, Arc<dyn ProviderAdapter>)>,
    tools: Vec<(ToolSpec, Arc<dyn Tool>)>,
}

impl CoreBuilder {
    pub fn new(default_binding: ModelBinding) -> Self {
        Self {
            config: CoreConfig::default(),
            default_binding,
            snapshots: None,
            sessions: None,
            providers: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable snapshot backend (defaults to in-memory)
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Durable session index (defaults to in-memory)
    pub fn session_index(mut self, index: Arc<dyn SessionIndex>) -> Self {
        self.sessions = Some(index);
        self
    }

    /// Register a provider adapter under its binding key
    pub fn provider(mut self, key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push((key.into(), adapter));
        self
    }

    /// Register an external tool
    pub fn tool(mut self, spec: ToolSpec, invoker: Arc<dyn Tool>) -> Self {
        self.tools.push((spec, invoker));
        self
    }

    /// Assemble the runtime. Must run inside a tokio runtime: the bus
    /// delivery worker is spawned here.
    pub fn build(self) -> Result<Arc<PenguinCore>> {
        let registry = Arc::new(AgentRegistry::new(
            self.config.default_agent_id.clone(),
            self.default_binding,
        ));

        let bus = Arc::new(MessageBus::new());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        bus.set_delivery_sink(Arc::new(ConversationSink {
            registry: registry.clone(),
            queue: delivery_tx,
        }));
        tokio::spawn(deliver_bus_messages(registry.clone(), delivery_rx));

        let tools = Arc::new(ToolRegistry::new());
        let providers = Arc::new(ProviderRegistry::new());
        for (key, adapter) in self.providers {
            providers.register(key, adapter);
        }

        let dispatcher = ToolDispatcher::new(tools.clone());
        let engine = Arc::new(Engine::new(
            self.config.engine.clone(),
            providers.clone(),
            dispatcher,
        ));
        let health = Arc::new(HealthMonitor::new());

        let runner = Arc::new(CoreTaskRunner {
            registry: registry.clone(),
            engine: engine.clone(),
            health: health.clone(),
        });
        let executor = Arc::new(AgentExecutor::new(runner, self.config.max_concurrent_tasks));

        // Bridge tools whose semantics live in the core
        tools.register(
            ToolSpec::new("send_message", "Send a message to another agent or the human"),
            Arc::new(SendMessageTool { bus: bus.clone() }),
        )?;
        tools.register(
            ToolSpec::new("delegate", "Delegate work to another agent"),
            Arc::new(DelegateTool { bus: bus.clone() }),
        )?;
        tools.register(
            ToolSpec::new("spawn_sub_agent", "Spawn a sub-agent running a background task"),
            Arc::new(SpawnSubAgentTool {
                registry: registry.clone(),
                executor: executor.clone(),
            }),
        )?;
        tools.register(
            ToolSpec::new("notes_add", "Record a note in the agent's durable context"),
            Arc::new(NotesAddTool {
                registry: registry.clone(),
            }),
        )?;
        for (spec, invoker) in self.tools {
            tools.register(spec, invoker)?;
        }

        Ok(Arc::new(PenguinCore {
            config: self.config,
            registry,
            bus,
            tools,
            providers,
            engine,
            executor,
            snapshots: self
                .snapshots
                .unwrap_or_else(|| Arc::new(MemorySnapshotStore::new())),
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(MemorySessionIndex::new())),
            health,
            last_checkpoint: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// The runtime façade
pub struct PenguinCore {
    config: CoreConfig,
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    tools: Arc<ToolRegistry>,
    providers: Arc<ProviderRegistry>,
    engine: Arc<Engine>,
    executor: Arc<AgentExecutor>,
    snapshots: Arc<dyn SnapshotStore>,
    sessions: Arc<dyn SessionIndex>,
    health: Arc<HealthMonitor>,
    /// Latest checkpoint per agent, used as the parent pointer
    last_checkpoint: Mutex<BTreeMap<String, String>>,
}

impl PenguinCore {
    /// Builder entry point
    pub fn builder(default_binding: ModelBinding) -> CoreBuilder {
        CoreBuilder::new(default_binding)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn executor(&self) -> &Arc<AgentExecutor> {
        &self.executor
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    // ========================================================================
    // Agent lifecycle
    // ========================================================================

    /// Create an agent. Omitted bindings inherit the parent's (or the
    /// default agent's) model binding.
    pub async fn create_agent(
        &self,
        id: impl Into<String>,
        binding: Option<ModelBinding>,
        persona: Option<String>,
        parent: Option<String>,
    ) -> Result<AgentProfile> {
        let id = id.into();
        let binding = match binding {
            Some(binding) => binding,
            None => {
                let source = parent
                    .clone()
                    .unwrap_or_else(|| self.registry.default_agent_id().to_string());
                self.registry.get(&source)?.binding.clone()
            }
        };
        self.registry.insert(id.clone(), binding, persona, parent)?;
        info!(agent_id = %id, "agent created");
        self.registry.profile(&id).await
    }

    /// Delete an agent, optionally archiving its session first
    pub async fn delete_agent(&self, id: &str, preserve_session: bool) -> Result<()> {
        let record = self.registry.get(id)?;
        if preserve_session {
            let conversation = record.conversation.read().await;
            let payload = conversation.snapshot_state()?;
            let session_id = conversation.session().id;
            drop(conversation);
            let snapshot_id = self.snapshots.snapshot(
                &payload,
                None,
                Some(meta_for(id, Some("pre-delete archive"))),
            )?;
            self.sessions.record(id, session_id, &snapshot_id)?;
        }
        self.registry.remove(id)?;
        let _ = self.executor.cancel(id).await;
        info!(agent_id = %id, preserve_session, "agent deleted");
        Ok(())
    }

    pub async fn pause_agent(&self, id: &str) -> Result<()> {
        self.registry.update_flags(id, Some(true), None)?;
        // Pause the background task too; without one the flag alone
        // gates foreground runs
        let _ = self.executor.pause(id).await;
        Ok(())
    }

    pub async fn resume_agent(&self, id: &str) -> Result<()> {
        self.registry.update_flags(id, Some(false), None)?;
        let _ = self.executor.resume(id).await;
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<AgentProfile> {
        let mut profiles = Vec::new();
        for id in self.registry.ids() {
            if let Ok(profile) = self.registry.profile(&id).await {
                profiles.push(profile);
            }
        }
        profiles
    }

    pub async fn get_agent_profile(&self, id: &str) -> Result<AgentProfile> {
        self.registry.profile(id).await
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Process one input to a finalized response (foreground)
    pub async fn process(&self, agent_id: &str, input: &str) -> Result<EngineResult> {
        self.process_with_options(agent_id, input, EngineOptions::default())
            .await
    }

    /// Process with caller-supplied options (cancellation, event sink)
    pub async fn process_with_options(
        &self,
        agent_id: &str,
        input: &str,
        opts: EngineOptions,
    ) -> Result<EngineResult> {
        let record = self.registry.get(agent_id)?;
        if record.paused {
            return Err(CoreError::Refused(format!(
                "agent '{}' is paused",
                agent_id
            )));
        }

        let started = Instant::now();
        let _guard = record.run_lock.lock().await;
        self.registry
            .update_flags(agent_id, None, Some(ExecutionState::Running))?;

        let result = self
            .engine
            .run_response(&record.handle(), input, opts)
            .await;

        let latency_ms = started.elapsed().as_millis() as f64;
        match &result {
            Ok(_) => {
                self.health.record_request(latency_ms, true);
                self.registry
                    .update_flags(agent_id, None, Some(ExecutionState::Idle))?;
            }
            Err(_) => {
                self.health.record_request(latency_ms, false);
                self.registry
                    .update_flags(agent_id, None, Some(ExecutionState::Error))?;
            }
        }
        result
    }

    /// Stream one response; events arrive on the returned receiver while
    /// the run proceeds in the background.
    pub fn stream_chat(
        self: &Arc<Self>,
        agent_id: &str,
        input: &str,
    ) -> Result<UnboundedReceiver<StreamEvent>> {
        // Validate before spawning so unknown agents fail fast
        self.registry.get(agent_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let core = self.clone();
        let agent_id = agent_id.to_string();
        let input = input.to_string();

        tokio::spawn(async move {
            let opts = EngineOptions {
                events: Some(tx),
                ..EngineOptions::default()
            };
            if let Err(err) = core.process_with_options(&agent_id, &input, opts).await {
                warn!(agent_id = %agent_id, error = %err, "streamed run failed");
            }
        });

        Ok(rx)
    }

    /// Schedule a background task for an agent
    pub async fn run_task(
        &self,
        agent_id: &str,
        prompt: &str,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<()> {
        self.registry.get(agent_id)?;
        self.executor.spawn(agent_id, prompt, metadata).await
    }

    /// Snapshot of a background task
    pub async fn task_status(&self, agent_id: &str) -> Option<AgentTask> {
        self.executor.status(agent_id).await
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Route a message through the bus. The recipient must be a
    /// registered agent or the reserved "human".
    pub fn send_bus_message(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        channel: Option<String>,
    ) -> Result<()> {
        if recipient != HUMAN_RECIPIENT && !self.registry.contains(recipient) {
            return Err(CoreError::agent_not_found(recipient));
        }
        let mut message = BusMessage::new(sender, recipient, content);
        if let Some(channel) = channel {
            message = message.with_channel(channel);
        }
        self.bus.publish(message);
        Ok(())
    }

    /// Observe bus traffic (external interface, logs)
    pub fn subscribe_bus(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, UnboundedReceiver<BusMessage>) {
        self.bus.subscribe(filter)
    }

    // ========================================================================
    // Sessions and checkpoints
    // ========================================================================

    /// Persist the current conversation state; returns the snapshot id
    pub async fn save_checkpoint(&self, agent_id: &str, name: Option<&str>) -> Result<String> {
        let record = self.registry.get(agent_id)?;
        let conversation = record.conversation.read().await;
        let payload = conversation.snapshot_state()?;
        let session_id = conversation.session().id;
        drop(conversation);

        let parent = self
            .last_checkpoint
            .lock()
            .expect("checkpoint lock poisoned")
            .get(agent_id)
            .cloned();
        let snapshot_id =
            self.snapshots
                .snapshot(&payload, parent.as_deref(), Some(meta_for(agent_id, name)))?;
        self.sessions.record(agent_id, session_id, &snapshot_id)?;
        self.last_checkpoint
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(agent_id.to_string(), snapshot_id.clone());
        Ok(snapshot_id)
    }

    /// Checkpoints for one agent, newest first
    pub fn list_checkpoints(&self, agent_id: &str) -> Result<Vec<SnapshotDescriptor>> {
        let all = self.snapshots.list(usize::MAX, 0)?;
        Ok(all
            .into_iter()
            .filter(|d| d.agent_id.as_deref() == Some(agent_id))
            .collect())
    }

    /// Restore a checkpoint into the agent's live conversation
    pub async fn restore_checkpoint(&self, agent_id: &str, snapshot_id: &str) -> Result<()> {
        let record = self.registry.get(agent_id)?;
        let payload = self
            .snapshots
            .restore(snapshot_id)?
            .ok_or_else(|| CoreError::snapshot(format!("snapshot {} not found", snapshot_id)))?;
        let result = record.conversation.write().await.restore_state(&payload);
        result
    }

    /// Branch from a checkpoint: a child snapshot is written and its
    /// payload becomes the agent's live conversation. Returns the new id.
    pub async fn branch_from(&self, agent_id: &str, snapshot_id: &str) -> Result<String> {
        let record = self.registry.get(agent_id)?;
        let (new_id, payload) = self
            .snapshots
            .branch_from(snapshot_id, Some(meta_for(agent_id, Some("branch"))))?;
        record.conversation.write().await.restore_state(&payload)?;
        self.last_checkpoint
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(agent_id.to_string(), new_id.clone());
        Ok(new_id)
    }

    /// Archive the current session and start a fresh one. Returns the
    /// new session id.
    pub async fn new_session(&self, agent_id: &str) -> Result<Uuid> {
        let record = self.registry.get(agent_id)?;
        let mut conversation = record.conversation.write().await;
        let archived = conversation.new_session();
        let new_session_id = conversation.session().id;
        drop(conversation);

        let payload = serde_json::to_string(&archived)
            .map_err(|e| CoreError::snapshot(format!("serialize failed: {}", e)))?;
        let snapshot_id = self.snapshots.snapshot(
            &payload,
            None,
            Some(meta_for(agent_id, Some("archived session"))),
        )?;
        self.sessions.record(agent_id, archived.id, &snapshot_id)?;
        Ok(new_session_id)
    }

    /// Archived sessions for an agent, newest first
    pub fn list_sessions(&self, agent_id: &str) -> Result<Vec<SessionRecord>> {
        self.registry.get(agent_id)?;
        self.sessions.list(agent_id)
    }

    /// Load an archived session into the live conversation
    pub async fn load_session(&self, agent_id: &str, session_id: Uuid) -> Result<()> {
        let record = self.registry.get(agent_id)?;
        let snapshot_id = self
            .sessions
            .get(agent_id, session_id)?
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        let payload = self
            .snapshots
            .restore(&snapshot_id)?
            .ok_or_else(|| CoreError::snapshot(format!("snapshot {} not found", snapshot_id)))?;
        let result = record.conversation.write().await.restore_state(&payload);
        result
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Assemble the health document
    pub async fn health(&self) -> HealthReport {
        let running = self.executor.running_count().await;
        let max = self.executor.max_concurrent();
        let capacity = AgentCapacity {
            max,
            active: running,
            available: max.saturating_sub(running),
            utilization: if max == 0 {
                0.0
            } else {
                running as f64 / max as f64
            },
        };
        self.health.report(capacity)
    }

    /// Metrics hook shared with the API layer
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}

fn meta_for(agent_id: &str, name: Option<&str>) -> SnapshotMeta {
    let mut meta = SnapshotMeta::new();
    meta.insert("agent_id".to_string(), json!(agent_id));
    if let Some(name) = name {
        meta.insert("name".to_string(), json!(name));
    }
    meta
}

// ============================================================================
// Bus delivery: agent-recipient messages land in conversations
// ============================================================================

struct ConversationSink {
    registry: Arc<AgentRegistry>,
    queue: mpsc::UnboundedSender<BusMessage>,
}

impl AgentDeliverySink for ConversationSink {
    fn deliver(&self, message: &BusMessage) -> bool {
        if !self.registry.contains(&message.recipient) {
            return false;
        }
        // Appends happen on the ordered delivery worker so per-pair
        // ordering survives even when the conversation is busy.
        self.queue.send(message.clone()).is_ok()
    }
}

async fn deliver_bus_messages(
    registry: Arc<AgentRegistry>,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
) {
    while let Some(message) = rx.recv().await {
        let Ok(record) = registry.get(&message.recipient) else {
            continue;
        };
        let mut incoming = Message::new(
            MessageRole::User,
            MessageContent::Text(message.content.clone()),
            MessageCategory::Conversation,
        );
        incoming
            .metadata
            .insert("bus_sender".to_string(), json!(message.sender));
        incoming
            .metadata
            .insert("bus_kind".to_string(), json!(message.kind));
        if let Some(channel) = &message.channel {
            incoming
                .metadata
                .insert("bus_channel".to_string(), json!(channel));
        }
        record.conversation.write().await.add_message(incoming);
    }
}

// ============================================================================
// Background task runner
// ============================================================================

struct CoreTaskRunner {
    registry: Arc<AgentRegistry>,
    engine: Arc<Engine>,
    health: Arc<HealthMonitor>,
}

#[async_trait]
impl TaskRunner for CoreTaskRunner {
    async fn run(&self, agent_id: &str, prompt: &str, control: TaskControl) -> Result<String> {
        let record = self.registry.get(agent_id)?;
        let _guard = record.run_lock.lock().await;
        self.registry
            .update_flags(agent_id, None, Some(ExecutionState::Running))?;
        let started = Instant::now();

        let opts = EngineOptions {
            cancel: control.cancel,
            pause: control.pause,
            ..EngineOptions::default()
        };
        let result = self.engine.run_task(&record.handle(), prompt, opts).await;

        self.health
            .record_task(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                self.registry
                    .update_flags(agent_id, None, Some(ExecutionState::Completed))?;
                Ok(outcome.text)
            }
            Err(err) => {
                self.registry
                    .update_flags(agent_id, None, Some(ExecutionState::Error))?;
                Err(err)
            }
        }
    }
}

// ============================================================================
// Bridge tools: core semantics reachable from action tags
// ============================================================================

/// `send_message` payload: `recipient: content[: channel]`. The channel
/// suffix is taken only when the trailing segment is a single token.
fn parse_send_payload(payload: &str) -> Option<(String, String, Option<String>)> {
    let (recipient, rest) = payload.split_once(':')?;
    let rest = rest.trim_start();
    if let Some((content, maybe_channel)) = rest.rsplit_once(':') {
        let channel = maybe_channel.trim();
        if !channel.is_empty() && !channel.contains(char::is_whitespace) {
            return Some((
                recipient.trim().to_string(),
                content.trim_end().to_string(),
                Some(channel.to_string()),
            ));
        }
    }
    Some((recipient.trim().to_string(), rest.to_string(), None))
}

struct SendMessageTool {
    bus: Arc<MessageBus>,
}

#[async_trait]
impl Tool for SendMessageTool {
    async fn invoke(&self, payload: &str, ctx: &ToolContext) -> ToolOutcome {
        let Some((recipient, content, channel)) = parse_send_payload(payload) else {
            return ToolOutcome::tool_error(
                "send_message payload must be 'recipient: content[: channel]'",
            );
        };
        let mut message = BusMessage::new(ctx.agent_id.clone(), recipient.clone(), content);
        if let Some(channel) = channel {
            message = message.with_channel(channel);
        }
        self.bus.publish(message);
        ToolOutcome::text(format!("Message sent to {}", recipient))
    }
}

struct DelegateTool {
    bus: Arc<MessageBus>,
}

#[async_trait]
impl Tool for DelegateTool {
    async fn invoke(&self, payload: &str, ctx: &ToolContext) -> ToolOutcome {
        let Some((target, content)) = payload.split_once(':') else {
            return ToolOutcome::tool_error("delegate payload must be 'target_agent: content'");
        };
        let target = target.trim().to_string();
        let message = BusMessage::new(ctx.agent_id.clone(), target.clone(), content.trim())
            .with_kind(BusMessageKind::Delegation);
        self.bus.publish(message);
        ToolOutcome::text(format!("Delegated to {}", target))
    }
}

struct SpawnSubAgentTool {
    registry: Arc<AgentRegistry>,
    executor: Arc<AgentExecutor>,
}

#[async_trait]
impl Tool for SpawnSubAgentTool {
    async fn invoke(&self, payload: &str, ctx: &ToolContext) -> ToolOutcome {
        let spec: Value = match serde_json::from_str(payload) {
            Ok(spec) => spec,
            Err(e) => {
                return ToolOutcome::tool_error(format!(
                    "spawn_sub_agent payload must be JSON: {}",
                    e
                ))
            }
        };
        let Some(id) = spec.get("id").and_then(|v| v.as_str()) else {
            return ToolOutcome::tool_error("spawn_sub_agent spec requires an 'id'");
        };
        let Some(prompt) = spec.get("prompt").and_then(|v| v.as_str()) else {
            return ToolOutcome::tool_error("spawn_sub_agent spec requires a 'prompt'");
        };
        let persona = spec
            .get("persona")
            .and_then(|v| v.as_str())
            .map(String::from);

        // Sub-agents inherit the caller's model binding
        let binding = match self.registry.get(&ctx.agent_id) {
            Ok(record) => record.binding.clone(),
            Err(e) => return ToolOutcome::tool_error(e.to_string()),
        };

        if !self.registry.contains(id) {
            if let Err(e) =
                self.registry
                    .insert(id, binding, persona, Some(ctx.agent_id.clone()))
            {
                return ToolOutcome::tool_error(e.to_string());
            }
        }
        match self.executor.spawn(id, prompt, None).await {
            Ok(()) => ToolOutcome::text(format!("Spawned sub-agent '{}'", id)),
            Err(e) => ToolOutcome::tool_error(e.to_string()),
        }
    }
}

/// `notes_add` payload: `category: content`
struct NotesAddTool {
    registry: Arc<AgentRegistry>,
}

#[async_trait]
impl Tool for NotesAddTool {
    async fn invoke(&self, payload: &str, ctx: &ToolContext) -> ToolOutcome {
        let (category, content) = match payload.split_once(':') {
            Some((c, rest)) => (c.trim().to_string(), rest.trim().to_string()),
            None => ("general".to_string(), payload.trim().to_string()),
        };
        let record = match self.registry.get(&ctx.agent_id) {
            Ok(record) => record,
            Err(e) => return ToolOutcome::tool_error(e.to_string()),
        };
        let mut note = Message::new(
            MessageRole::User,
            MessageContent::Text(content),
            MessageCategory::DeclarativeNotes,
        );
        note.metadata
            .insert("note_category".to_string(), json!(category));
        record.conversation.write().await.add_message(note);
        ToolOutcome::text(format!("Note recorded under '{}'", category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ReplayAdapter;

    async fn core_with_replay(scripts: Vec<crate::provider::ReplayScript>) -> Arc<PenguinCore> {
        PenguinCore::builder(ModelBinding::replay())
            .provider("replay", Arc::new(ReplayAdapter::new(scripts)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_send_payload() {
        assert_eq!(
            parse_send_payload("worker: do the thing"),
            Some(("worker".into(), "do the thing".into(), None))
        );
        assert_eq!(
            parse_send_payload("worker: status update: ops"),
            Some(("worker".into(), "status update".into(), Some("ops".into())))
        );
        // A trailing segment with spaces is content, not a channel
        assert_eq!(
            parse_send_payload("worker: see notes: the second half"),
            Some(("worker".into(), "see notes: the second half".into(), None))
        );
        assert_eq!(parse_send_payload("no separator"), None);
    }

    #[tokio::test]
    async fn test_default_agent_created_at_startup() {
        let core = core_with_replay(vec![]).await;
        let profile = core.get_agent_profile("default").await.unwrap();
        assert_eq!(profile.id, "default");
        assert!(core.list_agents().await.len() == 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_structured_error() {
        let core = core_with_replay(vec![]).await;
        let err = core.process("ghost", "hi").await.unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
        assert!(!err.envelope().error.recoverable);
    }

    #[tokio::test]
    async fn test_send_bus_message_validates_recipient() {
        let core = core_with_replay(vec![]).await;
        assert!(core
            .send_bus_message("default", "nobody", "hi", None)
            .is_err());
        core.send_bus_message("default", "human", "hello", None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_bus_message_persists_into_conversation() {
        let core = core_with_replay(vec![]).await;
        core.create_agent("worker", None, None, Some("default".into()))
            .await
            .unwrap();
        core.send_bus_message("default", "worker", "ping", Some("ops".into()))
            .unwrap();

        // Delivery runs on the ordered worker; give it a beat
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let record = core.registry.get("worker").unwrap();
        let conversation = record.conversation.read().await;
        let last = conversation.session().messages.last().unwrap();
        assert_eq!(last.text(), Some("ping"));
        assert_eq!(last.metadata.get("bus_sender"), Some(&json!("default")));
        assert_eq!(last.metadata.get("bus_channel"), Some(&json!("ops")));
    }

    #[tokio::test]
    async fn test_human_message_reaches_subscribers_only() {
        let core = core_with_replay(vec![]).await;
        let (_handle, mut rx) =
            core.subscribe_bus(SubscriptionFilter::for_recipient(HUMAN_RECIPIENT));
        core.send_bus_message("default", "human", "surface me", None)
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.content, "surface me");

        let record = core.registry.get("default").unwrap();
        assert!(record.conversation.read().await.session().messages.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let core = core_with_replay(vec![]).await;
        let record = core.registry.get("default").unwrap();
        record
            .conversation
            .write()
            .await
            .add_message(Message::user("before checkpoint"));

        let snap = core.save_checkpoint("default", Some("s1")).await.unwrap();

        record
            .conversation
            .write()
            .await
            .add_message(Message::user("after checkpoint"));
        assert_eq!(
            record.conversation.read().await.session().messages.len(),
            2
        );

        core.restore_checkpoint("default", &snap).await.unwrap();
        assert_eq!(
            record.conversation.read().await.session().messages.len(),
            1
        );

        let checkpoints = core.list_checkpoints("default").unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].name.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_branch_independence() {
        let core = core_with_replay(vec![]).await;
        let record = core.registry.get("default").unwrap();
        record
            .conversation
            .write()
            .await
            .add_message(Message::user("shared history"));
        let s1 = core.save_checkpoint("default", None).await.unwrap();
        let before = core.snapshots.restore(&s1).unwrap().unwrap();

        // Branch, then mutate the live conversation
        let s2 = core.branch_from("default", &s1).await.unwrap();
        record
            .conversation
            .write()
            .await
            .add_message(Message::user("divergence"));

        assert_ne!(s1, s2);
        // The original snapshot is untouched by post-branch mutation
        assert_eq!(core.snapshots.restore(&s1).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_new_session_archives_old() {
        let core = core_with_replay(vec![]).await;
        let record = core.registry.get("default").unwrap();
        let old_session = record.conversation.read().await.session().id;
        record
            .conversation
            .write()
            .await
            .add_message(Message::user("old stuff"));

        let new_session = core.new_session("default").await.unwrap();
        assert_ne!(old_session, new_session);

        let sessions = core.list_sessions("default").unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, old_session);

        // Loading the archived session brings the old messages back
        core.load_session("default", old_session).await.unwrap();
        let conversation = record.conversation.read().await;
        assert_eq!(conversation.session().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_health_document_shape() {
        let core = core_with_replay(vec![]).await;
        let report = core.health().await;
        assert_eq!(report.agent_capacity.max, 10);
        assert_eq!(report.agent_capacity.available, 10);
        assert_eq!(
            report.performance_metrics.request_count, 0
        );
    }

    #[tokio::test]
    async fn test_delete_refuses_root() {
        let core = core_with_replay(vec![]).await;
        let err = core.delete_agent("default", false).await.unwrap_err();
        assert_eq!(err.code(), "OPERATION_REFUSED");
    }
}
