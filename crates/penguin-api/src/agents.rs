// Agent CRUD HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use penguin_core::{AgentProfile, ModelBinding};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::common::{ApiResult, AppState, ListResponse};

/// Request to create an agent
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateAgentRequest {
    pub id: String,
    /// Inherits the parent's (or default agent's) binding when omitted
    pub model: Option<ModelBindingRequest>,
    pub persona: Option<String>,
    pub parent: Option<String>,
}

/// Model binding fields accepted on create
#[derive(Debug, Deserialize, ToSchema)]
pub struct ModelBindingRequest {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub context_window: Option<usize>,
}

impl From<ModelBindingRequest> for ModelBinding {
    fn from(req: ModelBindingRequest) -> Self {
        let mut binding = ModelBinding::new(req.provider, req.model);
        binding.temperature = req.temperature;
        binding.max_output_tokens = req.max_output_tokens;
        if let Some(window) = req.context_window {
            binding.context_window = window;
        }
        binding
    }
}

/// Query for delete
#[derive(Debug, Deserialize)]
pub struct DeleteAgentParams {
    #[serde(default)]
    pub preserve_session: bool,
}

/// Create agent routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/agents", post(create_agent).get(list_agents))
        .route(
            "/v1/agents/:agent_id",
            get(get_agent).delete(delete_agent),
        )
        .route("/v1/agents/:agent_id/pause", post(pause_agent))
        .route("/v1/agents/:agent_id/resume", post(resume_agent))
        .with_state(state)
}

/// POST /v1/agents - Create a new agent
#[utoipa::path(
    post,
    path = "/v1/agents",
    request_body = CreateAgentRequest,
    responses(
        (status = 201, description = "Agent created successfully"),
        (status = 403, description = "Agent id already exists"),
        (status = 404, description = "Parent agent not found")
    ),
    tag = "agents"
)]
pub async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentProfile>)> {
    let profile = state
        .core
        .create_agent(
            req.id,
            req.model.map(ModelBinding::from),
            req.persona,
            req.parent,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// GET /v1/agents
#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, description = "List of agents")),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<AppState>) -> Json<ListResponse<AgentProfile>> {
    Json(state.core.list_agents().await.into())
}

/// GET /v1/agents/:agent_id
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses(
        (status = 200, description = "Agent profile"),
        (status = 404, description = "Agent not found")
    ),
    tag = "agents"
)]
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentProfile>> {
    Ok(Json(state.core.get_agent_profile(&agent_id).await?))
}

/// DELETE /v1/agents/:agent_id
#[utoipa::path(
    delete,
    path = "/v1/agents/{agent_id}",
    params(
        ("agent_id" = String, Path, description = "Agent ID"),
        ("preserve_session" = bool, Query, description = "Archive the session before deletion")
    ),
    responses(
        (status = 204, description = "Agent deleted"),
        (status = 403, description = "The default agent cannot be deleted"),
        (status = 404, description = "Agent not found")
    ),
    tag = "agents"
)]
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<DeleteAgentParams>,
) -> ApiResult<StatusCode> {
    state
        .core
        .delete_agent(&agent_id, params.preserve_session)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/agents/:agent_id/pause
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/pause",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses((status = 204, description = "Agent paused")),
    tag = "agents"
)]
pub async fn pause_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.core.pause_agent(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/agents/:agent_id/resume
#[utoipa::path(
    post,
    path = "/v1/agents/{agent_id}/resume",
    params(("agent_id" = String, Path, description = "Agent ID")),
    responses((status = 204, description = "Agent resumed")),
    tag = "agents"
)]
pub async fn resume_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.core.resume_agent(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
