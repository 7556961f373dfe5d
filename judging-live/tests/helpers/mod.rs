//! Shared fixtures for judging-live integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use judging_common::model::{CriterionDoc, ScoringConfigDoc};
use judging_common::{
    ChangeKind, ProjectMeta, RawValue, ScoreChange, ScoreKey, ScoreRecord, TrackDefinition,
    TrackLeaderboard,
};
use judging_live::config::{EngineSettings, FeedSettings};
use judging_live::{ChangeFeed, Error, JudgingEngine, Result, ScoreStore};

pub const EVENT: &str = "hack-2025";

#[derive(Default)]
struct MemoryState {
    tracks: BTreeMap<(String, String), TrackDefinition>,
    projects: BTreeMap<(String, String), ProjectMeta>,
    records: BTreeMap<(String, ScoreKey), ScoreRecord>,
    tombstones: BTreeMap<(String, ScoreKey), DateTime<Utc>>,
}

/// In-memory score store with a controllable change feed
///
/// `drop_feed` closes every attached feed, as a store outage would.
/// `write_silently` changes a row without emitting a change, so a test can
/// tell whether the engine picked it up through a snapshot resync.
pub struct MemoryScoreStore {
    state: Mutex<MemoryState>,
    changes: Mutex<broadcast::Sender<ScoreChange>>,
    refuse_subscribe: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryScoreStore {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            changes: Mutex::new(tx),
            refuse_subscribe: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn add_track(&self, definition: TrackDefinition) {
        let key = (definition.event_id.clone(), definition.track_id.clone());
        self.state.lock().unwrap().tracks.insert(key, definition);
    }

    pub fn add_project(&self, event_id: &str, project_id: &str, name: &str, lead: &str) {
        self.state.lock().unwrap().projects.insert(
            (event_id.to_string(), project_id.to_string()),
            ProjectMeta {
                project_id: project_id.to_string(),
                project_name: name.to_string(),
                lead_name: lead.to_string(),
            },
        );
    }

    /// Close every attached feed; new subscriptions get a fresh channel
    pub fn drop_feed(&self) {
        let (tx, _) = broadcast::channel(256);
        *self.changes.lock().unwrap() = tx;
    }

    /// Make subscribe attempts fail until re-enabled
    pub fn set_refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::SeqCst);
    }

    /// Make snapshot listing fail until re-enabled
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn write_silently(&self, record: ScoreRecord) {
        let key = (record.event_id.clone(), record.key());
        self.state.lock().unwrap().records.insert(key, record);
    }

    pub fn remove_silently(&self, event_id: &str, key: &ScoreKey) {
        self.state
            .lock()
            .unwrap()
            .records
            .remove(&(event_id.to_string(), key.clone()));
    }

    pub fn feed_receivers(&self) -> usize {
        self.changes.lock().unwrap().receiver_count()
    }

    fn publish(&self, kind: ChangeKind, record: ScoreRecord) {
        let project = self
            .state
            .lock()
            .unwrap()
            .projects
            .get(&(record.event_id.clone(), record.project_id.clone()))
            .cloned();
        let mut change = ScoreChange::new(kind, record);
        if let Some(meta) = project {
            change = change.with_project(meta);
        }
        let _ = self.changes.lock().unwrap().send(change);
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn get_track_config(&self, event_id: &str, track_id: &str) -> Result<Option<TrackDefinition>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tracks
            .get(&(event_id.to_string(), track_id.to_string()))
            .cloned())
    }

    async fn list_tracks(&self, event_id: &str) -> Result<Vec<TrackDefinition>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Internal("store unreachable".to_string()));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .tracks
            .values()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn list_projects(&self, event_id: &str) -> Result<Vec<ProjectMeta>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .projects
            .iter()
            .filter(|((e, _), _)| e == event_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn list_score_records(&self, event_id: &str) -> Result<Vec<ScoreRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn subscribe_score_changes(&self, event_id: &str) -> Result<ChangeFeed> {
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(Error::FeedDisconnected("store unreachable".to_string()));
        }
        let rx = self.changes.lock().unwrap().subscribe();
        Ok(ChangeFeed::new(event_id, rx))
    }

    async fn upsert_score_record(&self, record: ScoreRecord) -> Result<Option<ChangeKind>> {
        let kind = {
            let mut state = self.state.lock().unwrap();
            let key = (record.event_id.clone(), record.key());
            let stored = state.records.get(&key).map(|r| r.updated_at);
            let deleted = state.tombstones.get(&key).copied();
            if stored.max(deleted).is_some_and(|last| last > record.updated_at) {
                return Ok(None);
            }
            let kind = if stored.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            };
            state.tombstones.remove(&key);
            state.records.insert(key, record.clone());
            kind
        };
        self.publish(kind, record);
        Ok(Some(kind))
    }

    async fn delete_score_record(&self, event_id: &str, key: &ScoreKey) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let key = (event_id.to_string(), key.clone());
            state.records.remove(&key).map(|mut record| {
                record.updated_at = record.updated_at.max(Utc::now());
                state.tombstones.insert(key, record.updated_at);
                record
            })
        };
        match removed {
            Some(record) => {
                self.publish(ChangeKind::Delete, record);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Track with numeric criteria `(id, weight)` on `[0, 10]`
pub fn track(track_id: &str, criteria: &[(&str, f64)]) -> TrackDefinition {
    TrackDefinition {
        event_id: EVENT.to_string(),
        track_id: track_id.to_string(),
        name: track_id.to_uppercase(),
        scoring: Some(ScoringConfigDoc {
            name: track_id.to_string(),
            criteria: criteria
                .iter()
                .map(|(id, weight)| CriterionDoc {
                    id: id.to_string(),
                    name: id.to_string(),
                    weight: Some(*weight),
                    min: Some(0.0),
                    max: Some(10.0),
                    ..Default::default()
                })
                .collect(),
        }),
    }
}

pub fn base_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_760_000_000, 0).unwrap()
}

pub fn record(track_id: &str, project: &str, judge: &str, scores: &[(&str, f64)], at_secs: i64) -> ScoreRecord {
    ScoreRecord {
        project_id: project.to_string(),
        judge_id: judge.to_string(),
        track_id: track_id.to_string(),
        event_id: EVENT.to_string(),
        scores: scores
            .iter()
            .map(|(k, v)| (k.to_string(), RawValue::Number(*v)))
            .collect(),
        comments: None,
        updated_at: base_time() + Duration::seconds(at_secs),
    }
}

pub fn key(track_id: &str, project: &str, judge: &str) -> ScoreKey {
    ScoreKey {
        project_id: project.to_string(),
        judge_id: judge.to_string(),
        track_id: track_id.to_string(),
    }
}

/// Engine settings tuned for tests: small queues, fast reconnects
pub fn test_settings() -> (EngineSettings, FeedSettings) {
    (
        EngineSettings {
            grace_period_secs: 0,
            idle_timeout_secs: 0,
            eviction_interval_secs: 1,
            actor_mailbox: 64,
            subscriber_queue: 4,
        },
        FeedSettings {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
        },
    )
}

pub fn engine(store: Arc<MemoryScoreStore>) -> Arc<JudgingEngine> {
    let (settings, feed) = test_settings();
    JudgingEngine::new(store, settings, feed)
}

/// Poll a track's leaderboard until `check` holds or two seconds pass
pub async fn wait_for_board<F>(engine: &JudgingEngine, track_id: &str, check: F) -> bool
where
    F: Fn(&TrackLeaderboard) -> bool,
{
    for _ in 0..200 {
        if let Ok(board) = engine.get_leaderboard(EVENT, track_id).await {
            if check(&board) {
                return true;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

/// Score map of a leaderboard: project id to (average, judge count)
pub fn standings(entries: &[judging_common::RankedEntry]) -> HashMap<String, (f64, u32)> {
    entries
        .iter()
        .map(|e| (e.project_id.clone(), (e.average_score, e.judge_count)))
        .collect()
}
