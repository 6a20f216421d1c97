//! SSE piping for hub subscriptions.
//!
//! Turns a [`Subscription`] into a `text/event-stream` response: one
//! `connected` hello frame, then every replayed and live message as an
//! `id:`/`event:`/`data:` frame, with a `: ping` comment as keep-alive.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use super::stream_hub::{StreamHub, Subscription};

/// Shared state for the SSE endpoints.
#[derive(Clone)]
pub struct SseState {
    pub hub: StreamHub,
    pub keep_alive: Duration,
}

/// Pipe a hub subscription out as an SSE response.
///
/// Frames that fail to serialize are dropped rather than breaking the
/// stream; the job row remains the source of truth either way.
pub fn sse_response(
    subscription: Subscription,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Subscription { receiver, .. } = subscription;

    let connected = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("connected").data("ok"))
    });

    let events = ReceiverStream::new(receiver).filter_map(|msg| async move {
        Event::default()
            .id(msg.id.to_string())
            .event(msg.kind.clone())
            .json_data(&msg.payload)
            .ok()
            .map(Ok)
    });

    Sse::new(connected.chain(events))
        .keep_alive(KeepAlive::new().interval(keep_alive).text("ping"))
}
