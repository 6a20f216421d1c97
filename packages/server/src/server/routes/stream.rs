//! SSE streaming endpoint.
//!
//! GET /api/streams/:user_id?channels=a,b&last_seq=5
//!
//! Subscribes the client to its user's stream, replays buffered messages
//! newer than `last_seq`, then goes live. Authentication happens upstream
//! at the API gateway; this process trusts the user id in the path.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::kernel::sse::{sse_response, SseState};

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Comma-separated channel filter; empty means unscoped messages only.
    channels: Option<String>,
    /// Last sequence number the client saw; used for replay.
    last_seq: Option<u64>,
}

/// Build the axum router for SSE endpoints.
pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/api/streams/:user_id", get(stream_handler))
        .with_state(state)
}

/// SSE handler: subscribe to the hub and stream frames until disconnect.
async fn stream_handler(
    State(state): State<SseState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let channels: Vec<String> = query
        .channels
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();

    let subscription = state
        .hub
        .subscribe(user_id, channels, query.last_seq.unwrap_or(0))
        .await;

    sse_response(subscription, state.keep_alive)
}
