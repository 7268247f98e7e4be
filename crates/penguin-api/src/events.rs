// Event streaming HTTP routes (SSE)
//
// Two streams: per-agent chat streaming (the engine's stream.* events)
// and the bus feed of messages addressed to "human". Each SSE event
// carries the event name and a JSON data payload.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use penguin_core::{StreamEvent, SubscriptionFilter, HUMAN_RECIPIENT};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::common::{ApiError, AppState};

/// Query for the chat stream
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub input: String,
}

/// Create event routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/agents/:agent_id/stream", get(stream_chat))
        .route("/v1/events", get(stream_bus_events))
        .with_state(state)
}

/// GET /v1/agents/:agent_id/stream?input=... - Stream one response
#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}/stream",
    params(
        ("agent_id" = String, Path, description = "Agent ID"),
        ("input" = String, Query, description = "User input to process")
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 404, description = "Agent not found")
    ),
    tag = "events"
)]
pub async fn stream_chat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let rx = state.core.stream_chat(&agent_id, &params.input)?;

    tracing::info!(agent_id = %agent_id, "starting chat event stream");

    let stream = UnboundedReceiverStream::new(rx).map(|event: StreamEvent| {
        let json = serde_json::to_value(&event)
            .ok()
            .and_then(|v| v.get("data").cloned())
            .unwrap_or(serde_json::Value::Null);
        Ok(SseEvent::default()
            .event(event.name())
            .data(json.to_string()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /v1/events - Bus messages addressed to the human
#[utoipa::path(
    get,
    path = "/v1/events",
    responses(
        (status = 200, description = "Bus event stream", content_type = "text/event-stream")
    ),
    tag = "events"
)]
pub async fn stream_bus_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (_handle, rx) = state
        .core
        .subscribe_bus(SubscriptionFilter::for_recipient(HUMAN_RECIPIENT));

    tracing::info!("starting bus event stream");

    let stream = UnboundedReceiverStream::new(rx).map(|message| {
        let json = serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().event("bus.message").data(json))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
