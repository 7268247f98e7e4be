// Inter-agent messaging HTTP routes

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::common::{ApiResult, AppState};

/// Request to route a bus message
#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    /// Sender identity; defaults to "human"
    pub sender: Option<String>,
    /// A registered agent id or "human"
    pub recipient: String,
    pub content: String,
    pub channel: Option<String>,
}

/// Create messaging routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(send_message))
        .with_state(state)
}

/// POST /v1/messages - Route a message through the bus
#[utoipa::path(
    post,
    path = "/v1/messages",
    request_body = SendMessageRequest,
    responses(
        (status = 202, description = "Message routed"),
        (status = 404, description = "Recipient not registered")
    ),
    tag = "messages"
)]
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<StatusCode> {
    let sender = req.sender.as_deref().unwrap_or("human");
    state
        .core
        .send_bus_message(sender, &req.recipient, &req.content, req.channel)?;
    Ok(StatusCode::ACCEPTED)
}
