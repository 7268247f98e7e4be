// Error types for the runtime core
//
// Every error carries a stable machine-readable code, a recoverability
// flag, and a suggested action so the external interface layer can build
// its envelope without inspecting variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur inside the runtime core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Target agent does not exist in the registry
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Context window still over budget after trimming
    #[error("Context window exceeded for agent {agent_id}: {tokens} tokens over a budget of {budget}")]
    ContextWindowExceeded {
        agent_id: String,
        tokens: usize,
        budget: usize,
    },

    /// Provider transport failure (network, HTTP 5xx, rate limit)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider rejected our credentials
    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Executor has no free capacity and the agent already has an active task
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Background task execution failed
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// Tool registry was already frozen when a registration arrived
    #[error("Tool registry is locked; registration of '{0}' rejected")]
    RegistryLocked(String),

    /// Snapshot store I/O failure
    #[error("Snapshot store error: {0}")]
    Snapshot(String),

    /// Requested session does not exist for the agent
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation refused (e.g. deleting the root agent)
    #[error("Operation refused: {0}")]
    Refused(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        CoreError::Provider(msg.into())
    }

    /// Create a task execution error
    pub fn task(msg: impl Into<String>) -> Self {
        CoreError::TaskExecution(msg.into())
    }

    /// Create a snapshot store error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        CoreError::Snapshot(msg.into())
    }

    /// Create an agent-not-found error
    pub fn agent_not_found(agent_id: impl Into<String>) -> Self {
        CoreError::AgentNotFound(agent_id.into())
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            CoreError::ContextWindowExceeded { .. } => "CONTEXT_WINDOW_EXCEEDED",
            CoreError::Provider(_) => "PROVIDER_ERROR",
            CoreError::ProviderAuth(_) => "AUTHENTICATION_FAILED",
            CoreError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            CoreError::TaskExecution(_) => "TASK_EXECUTION_ERROR",
            CoreError::RegistryLocked(_) => "REGISTRY_LOCKED",
            CoreError::Snapshot(_) => "SNAPSHOT_IO_ERROR",
            CoreError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Refused(_) => "OPERATION_REFUSED",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller retry may succeed
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::Provider(_) | CoreError::ResourceExhausted(_) | CoreError::TaskExecution(_)
        )
    }

    /// Short operator-facing hint for the error envelope
    pub fn suggested_action(&self) -> &'static str {
        match self {
            CoreError::AgentNotFound(_) => "Check the agent id or create the agent first",
            CoreError::ContextWindowExceeded { .. } => {
                "Start a new session or reduce the input size"
            }
            CoreError::Provider(_) => "Retry after a short delay",
            CoreError::ProviderAuth(_) => "Verify the provider credentials",
            CoreError::ResourceExhausted(_) => "Retry once a task slot frees up",
            CoreError::TaskExecution(_) => "Inspect the task error and retry",
            CoreError::RegistryLocked(_) => "Register tools before the first dispatch",
            CoreError::Snapshot(_) => "Check snapshot store availability",
            CoreError::SessionNotFound(_) => "List sessions to find a valid id",
            CoreError::Cancelled => "Re-submit the request if still wanted",
            CoreError::Refused(_) => "This operation is not permitted",
            CoreError::Internal(_) => "Report this error with logs attached",
        }
    }

    /// Build the wire-format envelope for the external interface layer
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                recoverable: self.recoverable(),
                suggested_action: self.suggested_action().to_string(),
                details: None,
            },
        }
    }
}

/// Wire-format error envelope returned by the external interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

/// Inner body of the error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    pub suggested_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_recoverability() {
        let err = CoreError::agent_not_found("helper");
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
        assert!(!err.recoverable());

        let err = CoreError::provider("connection reset");
        assert_eq!(err.code(), "PROVIDER_ERROR");
        assert!(err.recoverable());
    }

    #[test]
    fn test_envelope_shape() {
        let env = CoreError::ResourceExhausted("executor full".into()).envelope();
        assert_eq!(env.error.code, "RESOURCE_EXHAUSTED");
        assert!(env.error.recoverable);
        assert!(!env.error.suggested_action.is_empty());
    }
}
