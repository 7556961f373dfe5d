//! HTTP server setup and routing

use axum::{
    routing::{delete, get, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::JudgingEngine;
use crate::error::{Error, Result};
use crate::store::ScoreStore;

/// Shared context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<JudgingEngine>,
    pub store: Arc<dyn ScoreStore>,
}

/// Build the router with every route and layer attached
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        // Leaderboards
        .route("/api/events/:event_id/leaderboard", get(super::handlers::event_leaderboards))
        .route(
            "/api/events/:event_id/tracks/:track_id/leaderboard",
            get(super::handlers::track_leaderboard),
        )
        .route(
            "/api/events/:event_id/tracks/:track_id/breakdown",
            get(super::handlers::track_breakdown),
        )
        .route("/api/events/:event_id/winners", get(super::handlers::winners))
        // Live push
        .route("/api/events/:event_id/stream", get(super::sse::leaderboard_stream))
        // Score mutations (store pass-through)
        .route("/api/scores", put(super::handlers::upsert_score))
        .route(
            "/api/events/:event_id/scores/:project_id/:judge_id/:track_id",
            delete(super::handlers::delete_score),
        )
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API until `shutdown` resolves
pub async fn run<F>(bind_addr: SocketAddr, ctx: AppContext, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind to {}: {}", bind_addr, e)))?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
