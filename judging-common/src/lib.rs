//! # Judging Common Library
//!
//! Shared code for the live judging services including:
//! - Scoring data model (score records, track configs, ranked entries)
//! - Leaderboard push events (LeaderboardEvent enum)
//! - Configuration loading
//! - SSE helpers
//! - Utility functions

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
pub use events::{FeedStatus, LeaderboardEvent};
pub use model::{
    ChangeKind, Criterion, CriterionKind, ProjectMeta, RankedEntry, RawValue, ScoreChange,
    ScoreKey, ScoreRecord, TrackConfig, TrackDefinition, TrackLeaderboard,
};
