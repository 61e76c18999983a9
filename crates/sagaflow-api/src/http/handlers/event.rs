//! Server-Sent Events feed of engine events.
//!
//! Each [`EngineEvent`] is sent as one SSE message whose event name is the
//! event type (`instance_status_changed`, `step_failed`, ...) and whose data
//! is the JSON-encoded event. Slow consumers that fall behind the broadcast
//! buffer receive a `lagged` message and should re-read state via the query
//! endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use sagaflow_types::event::EngineEvent;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    /// Only forward events for this instance.
    pub instance_id: Option<uuid::Uuid>,
}

fn to_sse(event: &EngineEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// GET /api/v1/events?instance_id=
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.events().subscribe();
    let filter = query.instance_id;

    let sse_stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.is_some_and(|id| id != event.instance_id()) {
                        continue;
                    }
                    yield Ok::<_, Infallible>(to_sse(&event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagged");
                    let data = serde_json::json!({ "skipped": skipped });
                    yield Ok(Event::default().event("lagged").data(data.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
