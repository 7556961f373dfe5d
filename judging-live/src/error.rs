//! Error types for judging-live
//!
//! Engine failures map onto the taxonomy the dashboard understands:
//! unknown tracks, feed outages, unavailable actors. Stale events and
//! subscriber backpressure are normal outcomes and never surface as errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for judging-live
#[derive(Error, Debug)]
pub enum Error {
    /// The track does not exist for the event
    #[error("Unknown track {track_id} for event {event_id}")]
    ConfigNotFound { event_id: String, track_id: String },

    /// The store's change feed could not be reached
    #[error("Change feed disconnected: {0}")]
    FeedDisconnected(String),

    /// A track actor stopped before answering
    #[error("Track actor unavailable: {0}")]
    ActorUnavailable(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request or stored document
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using judging-live Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<judging_common::Error> for Error {
    fn from(err: judging_common::Error) -> Self {
        match err {
            judging_common::Error::Database(e) => Error::Database(e),
            judging_common::Error::Config(msg) => Error::Config(msg),
            judging_common::Error::InvalidInput(msg) => Error::InvalidInput(msg),
            judging_common::Error::NotFound(msg) => Error::NotFound(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidInput(format!("JSON: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::ConfigNotFound { .. } => {
                (StatusCode::NOT_FOUND, "UNKNOWN_TRACK", "unknown track".to_string())
            }
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            Error::FeedDisconnected(_) | Error::ActorUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                self.to_string(),
            ),
            Error::Config(_) | Error::Database(_) | Error::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
