//! Score record store interface
//!
//! The durable store is an external collaborator: it holds one row per
//! (project, judge, track), performs the two mutations (upsert, delete) and
//! emits a change notification for each. The engine only reads snapshots
//! and consumes the change feed.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use judging_common::{ChangeKind, ProjectMeta, ScoreChange, ScoreKey, ScoreRecord, TrackDefinition};

pub mod sqlite;

pub use sqlite::SqliteScoreStore;

/// Why a change feed stopped yielding events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The receiver fell behind and `n` changes were lost
    Lagged(u64),
    /// The store closed the feed
    Closed,
}

/// Change notifications for a single event
///
/// Wraps the store's broadcast channel and filters out other events.
pub struct ChangeFeed {
    event_id: String,
    rx: broadcast::Receiver<ScoreChange>,
}

impl ChangeFeed {
    pub fn new(event_id: &str, rx: broadcast::Receiver<ScoreChange>) -> Self {
        Self {
            event_id: event_id.to_string(),
            rx,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Next change for this event
    ///
    /// Any error means changes may have been missed; the caller must
    /// resubscribe and resync from a snapshot.
    pub async fn next(&mut self) -> std::result::Result<ScoreChange, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.record.event_id == self.event_id => return Ok(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}

/// Access to the durable score store
#[async_trait]
pub trait ScoreStore: Send + Sync + 'static {
    /// `GetTrackConfig`: `None` when the track does not exist for the event
    async fn get_track_config(&self, event_id: &str, track_id: &str) -> Result<Option<TrackDefinition>>;

    /// All tracks of the event, configured or not
    async fn list_tracks(&self, event_id: &str) -> Result<Vec<TrackDefinition>>;

    /// Display metadata of the event's projects
    async fn list_projects(&self, event_id: &str) -> Result<Vec<ProjectMeta>>;

    /// `ListScoreRecords`: every live score of the event (snapshot load)
    async fn list_score_records(&self, event_id: &str) -> Result<Vec<ScoreRecord>>;

    /// `SubscribeScoreChanges`: changes committed after this call returns
    async fn subscribe_score_changes(&self, event_id: &str) -> Result<ChangeFeed>;

    /// `UpsertScoreRecord`: `None` when the write was older than the stored
    /// row or than the key's last delete
    async fn upsert_score_record(&self, record: ScoreRecord) -> Result<Option<ChangeKind>>;

    /// `DeleteScoreRecord`: `false` when no such score existed
    ///
    /// The published delete carries the time later writes must not precede.
    async fn delete_score_record(&self, event_id: &str, key: &ScoreKey) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn change(event_id: &str) -> ScoreChange {
        ScoreChange::new(
            ChangeKind::Insert,
            ScoreRecord {
                project_id: "p1".to_string(),
                judge_id: "j1".to_string(),
                track_id: "t1".to_string(),
                event_id: event_id.to_string(),
                scores: BTreeMap::new(),
                comments: None,
                updated_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_feed_filters_other_events() {
        let (tx, rx) = broadcast::channel(8);
        let mut feed = ChangeFeed::new("ev-a", rx);

        tx.send(change("ev-b")).unwrap();
        tx.send(change("ev-a")).unwrap();

        let next = feed.next().await.unwrap();
        assert_eq!(next.record.event_id, "ev-a");
    }

    #[tokio::test]
    async fn test_feed_reports_lag_and_close() {
        let (tx, rx) = broadcast::channel(2);
        let mut feed = ChangeFeed::new("ev", rx);

        for _ in 0..4 {
            tx.send(change("ev")).unwrap();
        }
        assert_eq!(feed.next().await, Err(FeedError::Lagged(2)));

        drop(tx);
        // Remaining buffered changes drain before Closed
        assert!(feed.next().await.is_ok());
        assert!(feed.next().await.is_ok());
        assert_eq!(feed.next().await, Err(FeedError::Closed));
    }
}
