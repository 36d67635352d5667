use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::dispatch::StoredEvent;
use crate::http::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/events?limit=N - Newest buffered monitor events, oldest first
pub async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<StoredEvent>> {
    Json(state.monitor.ring().recent(query.limit))
}

/// GET /api/events/stream - Live monitor events as server-sent events
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.monitor.ring().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(stored) => match Event::default().event(stored.event.kind()).json_data(&stored) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!("Failed to encode event: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Event stream lagged: {}", e);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
