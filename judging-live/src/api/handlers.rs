//! HTTP request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::server::AppContext;
use crate::error::{Error, Result};
use crate::ranking::ProjectBreakdown;
use judging_common::{ChangeKind, RawValue, ScoreKey, ScoreRecord, TrackLeaderboard};

/// Winners per track when `top` is not given
pub const DEFAULT_WINNERS: usize = 3;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
    build_profile: String,
}

#[derive(Debug, Serialize)]
pub struct EventLeaderboardsResponse {
    pub event_id: String,
    pub tracks: Vec<TrackLeaderboard>,
}

#[derive(Debug, Serialize)]
pub struct BreakdownResponse {
    pub event_id: String,
    pub track_id: String,
    pub projects: Vec<ProjectBreakdown>,
}

#[derive(Debug, Deserialize)]
pub struct WinnersQuery {
    top: Option<usize>,
}

/// Body of `PUT /api/scores`
#[derive(Debug, Deserialize)]
pub struct ScoreSubmission {
    pub event_id: String,
    pub project_id: String,
    pub judge_id: String,
    pub track_id: String,
    #[serde(default)]
    pub scores: BTreeMap<String, RawValue>,
    pub comments: Option<String>,
    /// Defaults to the time the request is handled
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    status: &'static str,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "judging-live".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
    })
}

// ============================================================================
// Leaderboards
// ============================================================================

/// GET /api/events/:event_id/tracks/:track_id/leaderboard
pub async fn track_leaderboard(
    State(ctx): State<AppContext>,
    Path((event_id, track_id)): Path<(String, String)>,
) -> Result<Json<TrackLeaderboard>> {
    let board = ctx.engine.get_leaderboard(&event_id, &track_id).await?;
    Ok(Json(board))
}

/// GET /api/events/:event_id/leaderboard
pub async fn event_leaderboards(
    State(ctx): State<AppContext>,
    Path(event_id): Path<String>,
) -> Result<Json<EventLeaderboardsResponse>> {
    let tracks = ctx.engine.get_event_leaderboards(&event_id).await?;
    Ok(Json(EventLeaderboardsResponse { event_id, tracks }))
}

/// GET /api/events/:event_id/tracks/:track_id/breakdown
pub async fn track_breakdown(
    State(ctx): State<AppContext>,
    Path((event_id, track_id)): Path<(String, String)>,
) -> Result<Json<BreakdownResponse>> {
    let projects = ctx.engine.breakdown(&event_id, &track_id).await?;
    Ok(Json(BreakdownResponse {
        event_id,
        track_id,
        projects,
    }))
}

/// GET /api/events/:event_id/winners?top=N
pub async fn winners(
    State(ctx): State<AppContext>,
    Path(event_id): Path<String>,
    Query(query): Query<WinnersQuery>,
) -> Result<Json<EventLeaderboardsResponse>> {
    let top = query.top.unwrap_or(DEFAULT_WINNERS);
    if top == 0 {
        return Err(Error::InvalidInput("top must be at least 1".to_string()));
    }

    let tracks = ctx.engine.winners(&event_id, top).await?;
    Ok(Json(EventLeaderboardsResponse { event_id, tracks }))
}

// ============================================================================
// Score mutations
// ============================================================================

/// PUT /api/scores
///
/// Stores the judge's score; the change reaches the leaderboard through the
/// store's change feed. `stale` means a newer write was already stored.
pub async fn upsert_score(
    State(ctx): State<AppContext>,
    Json(submission): Json<ScoreSubmission>,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    require("event_id", &submission.event_id)?;
    require("project_id", &submission.project_id)?;
    require("judge_id", &submission.judge_id)?;
    require("track_id", &submission.track_id)?;

    let record = ScoreRecord {
        project_id: submission.project_id,
        judge_id: submission.judge_id,
        track_id: submission.track_id,
        event_id: submission.event_id,
        scores: submission.scores,
        comments: submission.comments,
        updated_at: submission.updated_at.unwrap_or_else(judging_common::time::now),
    };

    let response = match ctx.store.upsert_score_record(record).await? {
        Some(ChangeKind::Insert) => (StatusCode::CREATED, "inserted"),
        Some(_) => (StatusCode::OK, "updated"),
        None => (StatusCode::OK, "stale"),
    };
    Ok((response.0, Json(MutationResponse { status: response.1 })))
}

/// DELETE /api/events/:event_id/scores/:project_id/:judge_id/:track_id
pub async fn delete_score(
    State(ctx): State<AppContext>,
    Path((event_id, project_id, judge_id, track_id)): Path<(String, String, String, String)>,
) -> Result<Json<MutationResponse>> {
    let key = ScoreKey {
        project_id,
        judge_id,
        track_id,
    };

    if !ctx.store.delete_score_record(&event_id, &key).await? {
        return Err(Error::NotFound(format!(
            "no score for project {} by judge {} in track {}",
            key.project_id, key.judge_id, key.track_id
        )));
    }

    info!(
        event_id = %event_id,
        project_id = %key.project_id,
        judge_id = %key.judge_id,
        track_id = %key.track_id,
        "Score deleted"
    );
    Ok(Json(MutationResponse { status: "deleted" }))
}
