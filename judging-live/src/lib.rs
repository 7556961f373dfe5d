//! judging-live: live leaderboard aggregation for judging events
//!
//! Consumes score changes from the store's change feed, keeps per-track
//! running aggregates in single-owner actors, and pushes ranked
//! leaderboards to dashboard subscribers.

pub mod actor;
pub mod aggregate;
pub mod api;
pub mod broadcaster;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ranking;
pub mod resolver;
pub mod store;

pub use broadcaster::{LeaderboardSubscription, SubscriptionHub};
pub use config::Config;
pub use engine::JudgingEngine;
pub use error::{Error, Result};
pub use store::{ChangeFeed, FeedError, ScoreStore, SqliteScoreStore};
