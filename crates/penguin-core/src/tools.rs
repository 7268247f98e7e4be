// Tool registry and dispatcher
//
// Tools are named callables registered at startup. The registry freezes on
// first dispatch; after that, registration fails. The dispatcher maps
// action kinds to tool names, enforces per-call timeouts and deadlines,
// and converts every failure mode (timeout, cancellation, panic, invoker
// error) into a structured ToolResult. No exception escapes the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::parser::ActionKind;

/// Default per-tool execution budget
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Which agents may call a tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum ToolScope {
    /// Callable by every agent
    #[default]
    Any,
    /// Callable only by the listed agent ids
    Agents(HashSet<String>),
}

impl ToolScope {
    /// Whether the given agent may call a tool with this scope
    pub fn allows(&self, agent_id: &str) -> bool {
        match self {
            ToolScope::Any => true,
            ToolScope::Agents(ids) => ids.contains(agent_id),
        }
    }
}

/// A registered tool's declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique, stable name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Parameter schema (JSON schema value)
    pub parameters: Value,
    /// Allowed callers
    #[serde(default)]
    pub scope: ToolScope,
    /// Declared max duration; the dispatcher times out after this
    #[serde(default = "default_max_duration", with = "duration_secs")]
    pub max_duration: Duration,
}

fn default_max_duration() -> Duration {
    DEFAULT_TOOL_TIMEOUT
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Null,
            scope: ToolScope::Any,
            max_duration: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_scope(mut self, scope: ToolScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Context passed into every tool invocation
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_id: Uuid,
    pub iteration: usize,
    /// Absolute deadline; the dispatcher stops waiting past this point
    pub deadline: DateTime<Utc>,
    /// Cooperative cancellation; tools should observe it for long work
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id,
            iteration: 1,
            deadline: Utc::now() + chrono::Duration::seconds(300),
            cancel: CancellationToken::new(),
        }
    }

    /// Remaining wall time before the deadline
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or_default()
    }
}

/// Outcome an invoker reports.
///
/// `ToolError` is safe to surface to the LLM (validation failures, missing
/// resources). `InternalError` is logged in full but replaced with a
/// generic message before it reaches the model.
#[derive(Debug)]
pub enum ToolOutcome {
    Success(Value),
    ToolError(String),
    InternalError(String),
}

impl ToolOutcome {
    pub fn success(value: impl Into<Value>) -> Self {
        ToolOutcome::Success(value.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        ToolOutcome::Success(Value::String(text.into()))
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        ToolOutcome::ToolError(message.into())
    }
}

/// Trait implemented by every tool invoker
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, payload: &str, ctx: &ToolContext) -> ToolOutcome;
}

/// Classified failure inside a ToolResult
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    Exception,
    Cancelled,
    NotFound,
    ScopeDenied,
    RateLimited,
}

/// Per-(agent, tool) admission control. The default dispatcher carries no
/// limiter; installing one turns rejected calls into rate_limited results.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, agent_id: &str, tool_name: &str) -> bool;
}

/// Error detail inside a ToolResult
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// The structured result of one dispatch. Never an exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub duration_ms: u64,
    pub tool_name: String,
}

impl ToolResult {
    fn failure(tool_name: &str, kind: ToolErrorKind, message: String, started: Instant) -> Self {
        Self {
            ok: false,
            output: message.clone(),
            error: Some(ToolError { kind, message }),
            duration_ms: started.elapsed().as_millis() as u64,
            tool_name: tool_name.to_string(),
        }
    }
}

struct RegisteredTool {
    spec: ToolSpec,
    invoker: Arc<dyn Tool>,
}

/// Holds the named tools. Registration is open until the first dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
    frozen: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite, before freeze) a tool
    pub fn register(&self, spec: ToolSpec, invoker: Arc<dyn Tool>) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(CoreError::RegistryLocked(spec.name));
        }
        let name = spec.name.clone();
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(name, Arc::new(RegisteredTool { spec, invoker }));
        Ok(())
    }

    /// Look up a tool spec by name
    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .map(|t| t.spec.clone())
    }

    /// Specs of all tools the given agent may call
    pub fn list(&self, agent_id: &str) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .expect("tool registry lock poisoned")
            .values()
            .filter(|t| t.spec.scope.allows(agent_id))
            .map(|t| t.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Lock the registry; subsequent registrations fail
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Whether the registry is locked
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn resolve(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }
}

/// Executes tool invocations against the registry
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            rate_limiter: None,
        }
    }

    /// Install admission control over (agent, tool) pairs
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Dispatch an action kind with its payload. Freezes the registry on
    /// first use. All failure modes come back as `ok = false` results.
    pub async fn dispatch(&self, kind: ActionKind, payload: &str, ctx: &ToolContext) -> ToolResult {
        self.registry.freeze();
        let started = Instant::now();

        let Some(tool_name) = kind.tool_name() else {
            // finish_response / finish_task are engine signals
            return ToolResult::failure(
                kind.tag_name(),
                ToolErrorKind::NotFound,
                format!("'{}' is a loop signal, not a dispatchable tool", kind),
                started,
            );
        };

        self.dispatch_named(tool_name, payload, ctx, started).await
    }

    /// Dispatch a tool by its registry name (provider-native tool calls
    /// arrive with the name already resolved)
    pub async fn dispatch_tool(
        &self,
        tool_name: &str,
        payload: &str,
        ctx: &ToolContext,
    ) -> ToolResult {
        self.registry.freeze();
        self.dispatch_named(tool_name, payload, ctx, Instant::now())
            .await
    }

    async fn dispatch_named(
        &self,
        tool_name: &str,
        payload: &str,
        ctx: &ToolContext,
        started: Instant,
    ) -> ToolResult {
        let Some(tool) = self.registry.resolve(tool_name) else {
            return ToolResult::failure(
                tool_name,
                ToolErrorKind::NotFound,
                format!("Tool not registered: {}", tool_name),
                started,
            );
        };

        if !tool.spec.scope.allows(&ctx.agent_id) {
            return ToolResult::failure(
                tool_name,
                ToolErrorKind::ScopeDenied,
                format!("Agent '{}' may not call '{}'", ctx.agent_id, tool_name),
                started,
            );
        }

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&ctx.agent_id, tool_name) {
                return ToolResult::failure(
                    tool_name,
                    ToolErrorKind::RateLimited,
                    format!("Rate limit hit for '{}' on '{}'", ctx.agent_id, tool_name),
                    started,
                );
            }
        }

        let budget = tool.spec.max_duration.min(ctx.remaining());

        // Run the invoker on its own task so a panic is contained and the
        // work can be aborted on timeout or cancellation.
        let invoker = tool.invoker.clone();
        let payload_owned = payload.to_string();
        let invoke_ctx = ctx.clone();
        let mut handle =
            tokio::spawn(async move { invoker.invoke(&payload_owned, &invoke_ctx).await });

        let outcome = tokio::select! {
            joined = tokio::time::timeout(budget, &mut handle) => match joined {
                Err(_) => {
                    handle.abort();
                    warn!(tool = tool_name, timeout_secs = budget.as_secs(), "tool timed out");
                    return ToolResult::failure(
                        tool_name,
                        ToolErrorKind::Timeout,
                        format!("Tool '{}' timed out after {:?}", tool_name, budget),
                        started,
                    );
                }
                Ok(Err(join_err)) => {
                    error!(tool = tool_name, error = %join_err, "tool invoker panicked");
                    return ToolResult::failure(
                        tool_name,
                        ToolErrorKind::Exception,
                        format!("Tool '{}' raised: {}", tool_name, join_err),
                        started,
                    );
                }
                Ok(Ok(outcome)) => outcome,
            },
            _ = ctx.cancel.cancelled() => {
                handle.abort();
                return ToolResult::failure(
                    tool_name,
                    ToolErrorKind::Cancelled,
                    format!("Tool '{}' cancelled", tool_name),
                    started,
                );
            }
        };

        match outcome {
            ToolOutcome::Success(value) => {
                let output = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ToolResult {
                    ok: true,
                    output,
                    error: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    tool_name: tool_name.to_string(),
                }
            }
            ToolOutcome::ToolError(message) => ToolResult::failure(
                tool_name,
                ToolErrorKind::Exception,
                message,
                started,
            ),
            ToolOutcome::InternalError(message) => {
                // Full detail to the logs, generic message to the LLM
                error!(
                    tool = tool_name,
                    error = %message,
                    "tool internal error (details hidden from model)"
                );
                ToolResult::failure(
                    tool_name,
                    ToolErrorKind::Exception,
                    "An internal error occurred while executing the tool".to_string(),
                    started,
                )
            }
        }
    }
}

// ============================================================================
// Example tools for tests and wiring checks
// ============================================================================

/// Echoes its payload back
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn invoke(&self, payload: &str, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::text(payload.to_string())
    }
}

/// Always fails with a tool-level error
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    async fn invoke(&self, _payload: &str, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::tool_error("this tool always fails")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_echo() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolSpec::new("code_execution", "run code"),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let dispatcher = ToolDispatcher::new(registry_with_echo());
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher
            .dispatch(ActionKind::Execute, "print(1)", &ctx)
            .await;
        assert!(result.ok);
        assert_eq!(result.output, "print(1)");
        assert_eq!(result.tool_name, "code_execution");
    }

    #[tokio::test]
    async fn test_registry_frozen_after_first_dispatch() {
        let registry = registry_with_echo();
        let dispatcher = ToolDispatcher::new(registry.clone());
        let ctx = ToolContext::new("default", Uuid::now_v7());
        dispatcher.dispatch(ActionKind::Execute, "x", &ctx).await;

        let err = registry
            .register(ToolSpec::new("late", "too late"), Arc::new(EchoTool))
            .unwrap_err();
        assert_eq!(err.code(), "REGISTRY_LOCKED");
    }

    #[tokio::test]
    async fn test_missing_tool_is_a_result_not_an_error() {
        let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::new()));
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher.dispatch(ActionKind::Read, "a.txt", &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_invoker_error_is_captured() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolSpec::new("code_execution", "always fails"),
                Arc::new(FailingTool),
            )
            .unwrap();
        let dispatcher = ToolDispatcher::new(registry);
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher.dispatch(ActionKind::Execute, "", &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::Exception);
    }

    #[tokio::test]
    async fn test_timeout_produces_timeout_result() {
        struct SlowTool;

        #[async_trait]
        impl Tool for SlowTool {
            async fn invoke(&self, _payload: &str, _ctx: &ToolContext) -> ToolOutcome {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ToolOutcome::text("never")
            }
        }

        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolSpec::new("code_execution", "slow")
                    .with_max_duration(Duration::from_millis(20)),
                Arc::new(SlowTool),
            )
            .unwrap();
        let dispatcher = ToolDispatcher::new(registry);
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher.dispatch(ActionKind::Execute, "", &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_scope_denied() {
        let registry = Arc::new(ToolRegistry::new());
        let mut only = HashSet::new();
        only.insert("privileged".to_string());
        registry
            .register(
                ToolSpec::new("code_execution", "restricted").with_scope(ToolScope::Agents(only)),
                Arc::new(EchoTool),
            )
            .unwrap();
        let dispatcher = ToolDispatcher::new(registry);
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher.dispatch(ActionKind::Execute, "", &ctx).await;
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::ScopeDenied);
    }

    #[tokio::test]
    async fn test_finish_signal_never_dispatches() {
        let dispatcher = ToolDispatcher::new(registry_with_echo());
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher
            .dispatch(ActionKind::FinishResponse, "", &ctx)
            .await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn test_rate_limiter_seam() {
        struct DenyAll;
        impl RateLimiter for DenyAll {
            fn allow(&self, _agent_id: &str, _tool_name: &str) -> bool {
                false
            }
        }

        let dispatcher =
            ToolDispatcher::new(registry_with_echo()).with_rate_limiter(Arc::new(DenyAll));
        let ctx = ToolContext::new("default", Uuid::now_v7());
        let result = dispatcher.dispatch(ActionKind::Execute, "x", &ctx).await;
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::RateLimited);
    }

    #[test]
    fn test_list_filters_by_scope() {
        let registry = ToolRegistry::new();
        let mut only = HashSet::new();
        only.insert("a".to_string());
        registry
            .register(ToolSpec::new("open", ""), Arc::new(EchoTool))
            .unwrap();
        registry
            .register(
                ToolSpec::new("closed", "").with_scope(ToolScope::Agents(only)),
                Arc::new(EchoTool),
            )
            .unwrap();
        assert_eq!(registry.list("b").len(), 1);
        assert_eq!(registry.list("a").len(), 2);
    }
}
