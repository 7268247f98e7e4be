// Penguin API surface
//
// Maps the core façade's operations onto HTTP + SSE. Module per
// resource; each exposes `routes(state)` and the binary merges them.

pub mod agents;
pub mod common;
pub mod events;
pub mod health;
pub mod messages;
pub mod runs;
pub mod sessions;

use axum::Router;
use penguin_core::PenguinCore;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use common::AppState;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        agents::create_agent,
        agents::list_agents,
        agents::get_agent,
        agents::delete_agent,
        agents::pause_agent,
        agents::resume_agent,
        sessions::list_sessions,
        sessions::new_session,
        sessions::load_session,
        sessions::list_checkpoints,
        sessions::save_checkpoint,
        sessions::branch_from,
        runs::process,
        runs::create_task,
        runs::task_status,
        runs::cancel_task,
        events::stream_chat,
        events::stream_bus_events,
        messages::send_message,
        health::health,
    ),
    components(
        schemas(
            agents::CreateAgentRequest,
            agents::ModelBindingRequest,
            sessions::SaveCheckpointRequest,
            sessions::BranchRequest,
            runs::ProcessRequest,
            runs::CreateTaskRequest,
            messages::SendMessageRequest,
            common::RunResponse,
            common::ToolResultDto,
        )
    ),
    tags(
        (name = "agents", description = "Agent lifecycle endpoints"),
        (name = "sessions", description = "Session and checkpoint endpoints"),
        (name = "execution", description = "Foreground and background execution"),
        (name = "events", description = "SSE streaming endpoints"),
        (name = "messages", description = "Inter-agent messaging"),
        (name = "health", description = "Service health")
    ),
    info(
        title = "Penguin API",
        version = "0.3.0",
        description = "Multi-agent execution runtime",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

/// Build the full router for a core instance
pub fn build_router(core: Arc<PenguinCore>) -> Router {
    let state = AppState { core };
    Router::new()
        .merge(health::routes(state.clone()))
        .merge(agents::routes(state.clone()))
        .merge(sessions::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(events::routes(state.clone()))
        .merge(messages::routes(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
