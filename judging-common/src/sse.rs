//! Server-Sent Events (SSE) utilities
//!
//! Converts a stream of [`LeaderboardEvent`]s into an axum SSE response.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::warn;

use crate::events::LeaderboardEvent;

/// Keep-alive interval for leaderboard streams
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Convert one leaderboard event to an SSE frame
///
/// The SSE `event:` field carries the variant name so browser clients can
/// register one listener per kind.
pub fn to_sse_event(event: &LeaderboardEvent) -> Option<Event> {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to serialize SSE event: {}", e);
            None
        }
    }
}

/// Wrap a leaderboard event stream as an SSE response with keep-alive
///
/// # Example
/// ```rust,ignore
/// pub async fn event_stream(
///     State(state): State<AppState>,
///     Path(event_id): Path<String>,
/// ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
///     let subscription = state.engine.subscribe(&event_id).await?;
///     Ok(judging_common::sse::leaderboard_sse(subscription.into_stream()))
/// }
/// ```
pub fn leaderboard_sse<S>(events: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = LeaderboardEvent> + Send + 'static,
{
    let stream = events.filter_map(|event| async move { to_sse_event(&event).map(Ok) });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}
