// Session and checkpoint HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use penguin_core::{SessionRecord, SnapshotDescriptor};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::common::{ApiResult, AppState, ListResponse};

/// Request to save a checkpoint
#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveCheckpointRequest {
    pub name: Option<String>,
}

/// Request to branch from a checkpoint
#[derive(Debug, Deserialize, ToSchema)]
pub struct BranchRequest {
    pub snapshot_id: String,
}

/// Response carrying a snapshot id
#[derive(Debug, Serialize, ToSchema)]
pub struct SnapshotIdResponse {
    pub snapshot_id: String,
}

/// Response carrying a session id
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionIdResponse {
    pub session_id: Uuid,
}

/// Create session/checkpoint routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/agents/:agent_id/sessions",
            get(list_sessions).post(new_session),
        )
        .route(
            "/v1/agents/:agent_id/sessions/:session_id/load",
            post(load_session),
        )
        .route(
            "/v1/agents/:agent_id/checkpoints",
            get(list_checkpoints).post(save_checkpoint),
        )
        .route("/v1/agents/:agent_id/branch", post(branch_from))
        .with_state(state)
}

/// GET /v1/agents/:agent_id/sessions - Archived sessions, newest first
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}/sessions",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Archived sessions"),
        (status = 404, description = "Agent not found")
    ),
    tag = "sessions"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<ListResponse<SessionRecord>>> {
    Ok(Json(state.core.list_sessions(&agent_id)?.into()))
}

/// POST /v1/agents/:agent_id/sessions - Archive current, start fresh
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/sessions",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses(
        (status = 201, description = "New session started"),
        (status = 404, description = "Agent not found")
    ),
    tag = "sessions"
)]
pub async fn new_session(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<(StatusCode, Json<SessionIdResponse>)> {
    let session_id = state.core.new_session(&agent_id).await?;
    Ok((StatusCode::CREATED, Json(SessionIdResponse { session_id })))
}

/// POST /v1/agents/:agent_id/sessions/:session_id/load
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/sessions/{session_id}/load",
    params(
        ("agent_id" = String, Path, description = "Agent ID"),
        ("session_id" = Uuid, Path, description = "Session ID")
    ),
    responses(
        (status = 204, description = "Session loaded"),
        (status = 404, description = "Agent or session not found")
    ),
    tag = "sessions"
)]
pub async fn load_session(
    State(state): State<AppState>,
    Path((agent_id, session_id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    state.core.load_session(&agent_id, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/agents/:agent_id/checkpoints - Checkpoints, newest first
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}/checkpoints",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses((status = 200, description = "Checkpoint descriptors")),
    tag = "sessions"
)]
pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<ListResponse<SnapshotDescriptor>>> {
    state.core.get_agent_profile(&agent_id).await?;
    Ok(Json(state.core.list_checkpoints(&agent_id)?.into()))
}

/// POST /v1/agents/:agent_id/checkpoints - Save a checkpoint now
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/checkpoints",
    params(("agent_id" = String, Path, description = "Agent ID")),
    request_body = SaveCheckpointRequest,
    responses(
        (status = 201, description = "Checkpoint saved"),
        (status = 404, description = "Agent not found")
    ),
    tag = "sessions"
)]
pub async fn save_checkpoint(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<SaveCheckpointRequest>,
) -> ApiResult<(StatusCode, Json<SnapshotIdResponse>)> {
    let snapshot_id = state
        .core
        .save_checkpoint(&agent_id, req.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(SnapshotIdResponse { snapshot_id })))
}

/// POST /v1/agents/:agent_id/branch - Branch the conversation
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/branch",
    params(("agent_id" = String, Path, description = "Agent ID")),
    request_body = BranchRequest,
    responses(
        (status = 201, description = "Branched; live conversation now follows the branch"),
        (status = 404, description = "Agent not found"),
        (status = 500, description = "Snapshot missing")
    ),
    tag = "sessions"
)]
pub async fn branch_from(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<BranchRequest>,
) -> ApiResult<(StatusCode, Json<SnapshotIdResponse>)> {
    let snapshot_id = state.core.branch_from(&agent_id, &req.snapshot_id).await?;
    Ok((StatusCode::CREATED, Json(SnapshotIdResponse { snapshot_id })))
}
