//! Server-Sent Events leaderboard stream

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use tracing::debug;

use super::server::AppContext;
use crate::error::Result;

/// GET /api/events/:event_id/stream
///
/// Sends the current feed status and every track's ranking first, then a
/// full `TrackRanking` whenever a track's ranking changes.
pub async fn leaderboard_stream(
    State(ctx): State<AppContext>,
    Path(event_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let subscription = ctx.engine.subscribe(&event_id).await?;
    debug!(event_id = %event_id, subscriber = %subscription.id(), "SSE client connected");

    Ok(judging_common::sse::leaderboard_sse(subscription.into_stream()))
}
