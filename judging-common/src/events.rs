//! Leaderboard push events
//!
//! Events delivered to dashboard subscribers of an event. They are
//! serialized as JSON for SSE transmission; the SSE `event:` field is the
//! variant name returned by [`LeaderboardEvent::event_type`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{RankedEntry, TrackLeaderboard};

/// Health of the engine's connection to the score store's change feed
///
/// A dashboard shows "reconnecting" over the last-known snapshot while the
/// feed is down, and "no scores yet" only for an empty ranking while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Live,
    Reconnecting,
}

/// Events pushed to leaderboard subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LeaderboardEvent {
    /// Full current ranking of one track (never a diff)
    ///
    /// Emitted on subscribe for every track, then whenever an applied score
    /// changes the track's ranking.
    TrackRanking {
        event_id: String,
        track_id: String,
        track_name: String,
        /// Per-track, strictly increasing; lets clients drop late frames
        version: u64,
        feed_status: FeedStatus,
        entries: Vec<RankedEntry>,
        timestamp: DateTime<Utc>,
    },

    /// The change feed connection went down or came back
    FeedStatusChanged {
        event_id: String,
        status: FeedStatus,
        timestamp: DateTime<Utc>,
    },
}

impl LeaderboardEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            LeaderboardEvent::TrackRanking { .. } => "TrackRanking",
            LeaderboardEvent::FeedStatusChanged { .. } => "FeedStatus",
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            LeaderboardEvent::TrackRanking { event_id, .. }
            | LeaderboardEvent::FeedStatusChanged { event_id, .. } => event_id,
        }
    }

    /// Track id and version for ranking events
    pub fn track_version(&self) -> Option<(&str, u64)> {
        match self {
            LeaderboardEvent::TrackRanking { track_id, version, .. } => {
                Some((track_id.as_str(), *version))
            }
            LeaderboardEvent::FeedStatusChanged { .. } => None,
        }
    }

    pub fn from_leaderboard(board: TrackLeaderboard) -> Self {
        LeaderboardEvent::TrackRanking {
            event_id: board.event_id,
            track_id: board.track_id,
            track_name: board.track_name,
            version: board.version,
            feed_status: board.feed_status,
            entries: board.entries,
            timestamp: crate::time::now(),
        }
    }

    pub fn feed_status(event_id: &str, status: FeedStatus) -> Self {
        LeaderboardEvent::FeedStatusChanged {
            event_id: event_id.to_string(),
            status,
            timestamp: crate::time::now(),
        }
    }
}
