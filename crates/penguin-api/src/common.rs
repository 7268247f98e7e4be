// Common DTOs and the error envelope for the public API
//
// Every handler failure is serialized as
// { error: { code, message, recoverable, suggested_action } }
// with an HTTP status derived from the error code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use penguin_core::{CoreError, EngineResult, ToolResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<penguin_core::PenguinCore>,
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Handler-level error that renders the structured envelope
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code() {
            "AGENT_NOT_FOUND" | "SESSION_NOT_FOUND" => StatusCode::NOT_FOUND,
            "RESOURCE_EXHAUSTED" | "REGISTRY_LOCKED" => StatusCode::CONFLICT,
            "CONTEXT_WINDOW_EXCEEDED" => StatusCode::UNPROCESSABLE_ENTITY,
            "AUTHENTICATION_FAILED" => StatusCode::UNAUTHORIZED,
            "OPERATION_REFUSED" => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(code = self.0.code(), error = %self.0, "request failed");
        (status, Json(self.0.envelope())).into_response()
    }
}

/// Result alias for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// One tool result in a process response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ToolResultDto {
    pub tool_name: String,
    pub ok: bool,
    pub output: String,
    pub duration_ms: u64,
}

impl From<&ToolResult> for ToolResultDto {
    fn from(result: &ToolResult) -> Self {
        Self {
            tool_name: result.tool_name.clone(),
            ok: result.ok,
            output: result.output.clone(),
            duration_ms: result.duration_ms,
        }
    }
}

/// Finalized outcome of a process or task run
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunResponse {
    pub text: String,
    pub iterations: usize,
    /// normal | tool_exit | cancelled | error | iteration_cap | implicit_completion
    pub completion_reason: String,
    pub tool_results: Vec<ToolResultDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    pub pending_human_review: bool,
}

impl From<&EngineResult> for RunResponse {
    fn from(result: &EngineResult) -> Self {
        Self {
            text: result.text.clone(),
            iterations: result.iterations,
            completion_reason: serde_json::to_value(result.completion_reason)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "normal".to_string()),
            tool_results: result.tool_results.iter().map(ToolResultDto::from).collect(),
            total_tokens: result.usage.total_tokens,
            pending_human_review: result.pending_human_review,
        }
    }
}
