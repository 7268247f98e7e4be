// Execution HTTP routes: foreground processing and background tasks

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use penguin_core::AgentTask;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::common::{ApiResult, AppState, RunResponse};

/// Request body for foreground processing
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProcessRequest {
    pub input: String,
}

/// Request body for scheduling a background task
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub agent_id: String,
    pub prompt: String,
}

/// Create execution routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/agents/:agent_id/process", post(process))
        .route("/v1/tasks", post(create_task))
        .route(
            "/v1/tasks/:agent_id",
            get(task_status).delete(cancel_task),
        )
        .with_state(state)
}

/// POST /v1/agents/:agent_id/process - One input to one finalized response
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/process",
    params(("agent_id" = String, Path, description = "Agent ID")),
    request_body = ProcessRequest,
    responses(
        (status = 200, description = "Finalized response", body = RunResponse),
        (status = 404, description = "Agent not found"),
        (status = 422, description = "Context window exceeded")
    ),
    tag = "execution"
)]
pub async fn process(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<ProcessRequest>,
) -> ApiResult<Json<RunResponse>> {
    let result = state.core.process(&agent_id, &req.input).await?;
    Ok(Json(RunResponse::from(&result)))
}

/// POST /v1/tasks - Schedule a background task
#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 202, description = "Task scheduled"),
        (status = 404, description = "Agent not found"),
        (status = 409, description = "Agent already has an active task")
    ),
    tag = "execution"
)]
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<StatusCode> {
    state.core.run_task(&req.agent_id, &req.prompt, None).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /v1/tasks/:agent_id - Background task status
#[utoipa::path(
    get,
    path = "/v1/tasks/{agent_id}",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Task snapshot"),
        (status = 404, description = "No task for this agent")
    ),
    tag = "execution"
)]
pub async fn task_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentTask>, StatusCode> {
    state
        .core
        .task_status(&agent_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /v1/tasks/:agent_id - Cancel a background task
#[utoipa::path(
    delete,
    path = "/v1/tasks/{agent_id}",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses((status = 204, description = "Cancellation signalled")),
    tag = "execution"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.core.executor().cancel(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
