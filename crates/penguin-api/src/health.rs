// Health HTTP route

use axum::{extract::State, routing::get, Json, Router};
use penguin_core::HealthReport;

use crate::common::AppState;

/// Create the health route
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .with_state(state)
}

/// GET /v1/health - Full health document
#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, description = "Health document")),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.core.health().await)
}
