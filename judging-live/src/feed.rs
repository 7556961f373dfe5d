//! Change feed consumer
//!
//! One consumer per loaded event. It owns the event's routing table of
//! track actors, loads the snapshot, and forwards every change from the
//! store's feed to the single actor owning that track.
//!
//! Snapshot-then-live: the feed is attached *before* the snapshot is
//! listed, so a change committed in between is seen by both and applied
//! idempotently instead of being lost. Any feed failure (lag, close) is
//! treated as a disconnect: subscribers are told the feed is reconnecting,
//! the consumer backs off, re-attaches, and resyncs every track from a fresh
//! snapshot before going live again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actor::{spawn_track_actor, TrackHandle};
use crate::broadcaster::SubscriptionHub;
use crate::config::{EngineSettings, FeedSettings};
use crate::error::{Error, Result};
use crate::resolver::TrackConfigResolver;
use crate::store::{ChangeFeed, FeedError, ScoreStore};
use judging_common::{FeedStatus, ProjectMeta, ScoreChange, ScoreRecord, TrackConfig, TrackLeaderboard};

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    next: Duration,
}

impl Backoff {
    pub fn new(settings: &FeedSettings) -> Self {
        let initial = settings.initial_backoff();
        Self {
            initial,
            max: settings.max_backoff().max(initial),
            multiplier: settings.backoff_multiplier.max(1.0),
            next: initial,
        }
    }

    /// Delay before the next attempt; grows until `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

struct RunningTrack {
    handle: TrackHandle,
    task: JoinHandle<()>,
}

/// Aggregation runtime of one event
pub(crate) struct EventConsumer {
    event_id: String,
    store: Arc<dyn ScoreStore>,
    resolver: Arc<TrackConfigResolver>,
    hub: SubscriptionHub,
    mailbox: usize,
    actors: Mutex<HashMap<String, RunningTrack>>,
    last_activity: Mutex<Instant>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    /// Attach the feed, load the snapshot, and start consuming
    pub(crate) async fn start(
        event_id: &str,
        store: Arc<dyn ScoreStore>,
        resolver: Arc<TrackConfigResolver>,
        engine: &EngineSettings,
        feed_settings: &FeedSettings,
    ) -> Result<Arc<Self>> {
        let consumer = Arc::new(Self {
            event_id: event_id.to_string(),
            store,
            resolver,
            hub: SubscriptionHub::new(event_id, engine.subscriber_queue),
            mailbox: engine.actor_mailbox,
            actors: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            feed_task: Mutex::new(None),
        });

        let feed = match consumer.store.subscribe_score_changes(event_id).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!(event_id, "Change feed unavailable at startup: {}", e);
                consumer.hub.set_feed_status(FeedStatus::Reconnecting);
                None
            }
        };

        consumer.load_snapshot().await?;

        let task = tokio::spawn(run_feed(Arc::downgrade(&consumer), feed, feed_settings.clone()));
        *lock(&consumer.feed_task) = Some(task);

        info!(event_id, tracks = consumer.track_count(), "Event aggregation started");
        Ok(consumer)
    }

    pub(crate) fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub(crate) fn track_count(&self) -> usize {
        lock(&self.actors).len()
    }

    /// Time since the last score change or query touched the event
    pub(crate) fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Actor owning `track_id`, spawned on first sight
    ///
    /// An actor that stopped is replaced and rebuilt from the store.
    pub(crate) async fn actor(&self, track_id: &str) -> Result<TrackHandle> {
        let stopped = match lock(&self.actors).get(track_id) {
            Some(running) if !running.handle.is_closed() => return Ok(running.handle.clone()),
            Some(_) => true,
            None => false,
        };

        if stopped {
            warn!(event_id = %self.event_id, track_id, "Track actor stopped, rebuilding from the store");
            return self.restart_track(track_id).await;
        }

        let config = self.resolver.resolve(&self.event_id, track_id).await?;
        Ok(self.install_actor(config))
    }

    fn install_actor(&self, config: Arc<TrackConfig>) -> TrackHandle {
        let mut actors = lock(&self.actors);
        if let Some(existing) = actors.get(&config.track_id).filter(|r| !r.handle.is_closed()) {
            return existing.handle.clone();
        }

        let track_id = config.track_id.clone();
        let (handle, task) = spawn_track_actor(&self.event_id, config, self.hub.clone(), self.mailbox);
        let running = RunningTrack {
            handle: handle.clone(),
            task,
        };
        if let Some(stopped) = actors.insert(track_id.clone(), running) {
            stopped.task.abort();
            info!(event_id = %self.event_id, track_id = %track_id, "Replaced stopped track actor");
        }
        handle
    }

    /// Every actor, ordered by track id
    fn handles(&self) -> Vec<TrackHandle> {
        let actors = lock(&self.actors);
        let mut handles: Vec<TrackHandle> = actors.values().map(|r| r.handle.clone()).collect();
        handles.sort_by(|a, b| a.track_id().cmp(b.track_id()));
        handles
    }

    /// Current leaderboard of every known track
    pub(crate) async fn leaderboards(&self) -> Result<Vec<TrackLeaderboard>> {
        let mut boards = Vec::new();
        for handle in self.handles() {
            match handle.snapshot().await {
                Ok(board) => boards.push(board),
                Err(e) => {
                    // one failed track must not hide the others
                    error!(event_id = %self.event_id, track_id = %handle.track_id(), "Skipping track: {}", e);
                }
            }
        }
        Ok(boards)
    }

    /// Rebuild every track from the store's current records
    pub(crate) async fn load_snapshot(&self) -> Result<()> {
        let tracks = self.store.list_tracks(&self.event_id).await?;
        let projects: HashMap<String, ProjectMeta> = self
            .store
            .list_projects(&self.event_id)
            .await?
            .into_iter()
            .map(|p| (p.project_id.clone(), p))
            .collect();
        let projects = Arc::new(projects);
        let records = self.store.list_score_records(&self.event_id).await?;
        let record_count = records.len();

        let mut by_track: BTreeMap<String, Vec<ScoreRecord>> = BTreeMap::new();
        for definition in &tracks {
            self.resolver
                .prime(&self.event_id, TrackConfig::from_definition(definition));
            by_track.entry(definition.track_id.clone()).or_default();
        }
        // tracks known to this runtime but gone from the listing are reset too
        for handle in self.handles() {
            by_track.entry(handle.track_id().to_string()).or_default();
        }
        for record in records {
            by_track.entry(record.track_id.clone()).or_default().push(record);
        }

        for (track_id, records) in by_track {
            let handle = match self.actor(&track_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(
                        event_id = %self.event_id,
                        track_id = %track_id,
                        records = records.len(),
                        "Skipping scores of unresolvable track: {}", e
                    );
                    continue;
                }
            };
            if let Err(e) = handle.resync(records, projects.clone()).await {
                error!(event_id = %self.event_id, track_id = %track_id, "Resync failed: {}", e);
                self.forget_actor(&track_id);
            }
        }

        info!(
            event_id = %self.event_id,
            tracks = tracks.len(),
            records = record_count,
            "Snapshot loaded"
        );
        Ok(())
    }

    /// Replace a stopped actor and rebuild its track from the store
    async fn restart_track(&self, track_id: &str) -> Result<TrackHandle> {
        let config = self.resolver.resolve(&self.event_id, track_id).await?;
        let handle = self.install_actor(config);

        let records: Vec<ScoreRecord> = self
            .store
            .list_score_records(&self.event_id)
            .await?
            .into_iter()
            .filter(|r| r.track_id == track_id)
            .collect();
        let projects: HashMap<String, ProjectMeta> = self
            .store
            .list_projects(&self.event_id)
            .await?
            .into_iter()
            .map(|p| (p.project_id.clone(), p))
            .collect();

        handle.resync(records, Arc::new(projects)).await?;
        info!(event_id = %self.event_id, track_id, "Track actor restarted");
        Ok(handle)
    }

    fn forget_actor(&self, track_id: &str) {
        if let Some(running) = lock(&self.actors).remove(track_id) {
            running.task.abort();
        }
    }

    /// Forward one change to its track's actor
    pub(crate) async fn route(&self, change: ScoreChange) {
        self.touch();
        let track_id = change.record.track_id.clone();

        let handle = match self.actor(&track_id).await {
            Ok(handle) => handle,
            Err(Error::ConfigNotFound { .. }) => {
                warn!(
                    event_id = %self.event_id,
                    track_id = %track_id,
                    project_id = %change.record.project_id,
                    "Score for unknown track, skipping"
                );
                return;
            }
            Err(e) => {
                error!(event_id = %self.event_id, track_id = %track_id, "Cannot route score: {}", e);
                return;
            }
        };

        if let Err(e) = handle.apply(change).await {
            error!(event_id = %self.event_id, track_id = %track_id, "Track actor failed: {}", e);
            // the failed change is already in the store, so the rebuild includes it
            if let Err(e) = self.restart_track(&track_id).await {
                error!(event_id = %self.event_id, track_id = %track_id, "Track restart failed: {}", e);
            }
        }
    }

    /// Re-attach the feed, then resync from a fresh snapshot
    async fn reconnect(&self) -> Result<ChangeFeed> {
        let feed = self
            .store
            .subscribe_score_changes(&self.event_id)
            .await
            .map_err(|e| Error::FeedDisconnected(e.to_string()))?;
        self.load_snapshot().await?;
        Ok(feed)
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.feed_task).take() {
            task.abort();
        }
        for (_, running) in lock(&self.actors).drain() {
            running.task.abort();
        }
        self.hub.close();
        debug!(event_id = %self.event_id, "Event aggregation stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Feed loop; holds only a weak reference so eviction ends it
async fn run_feed(consumer: Weak<EventConsumer>, mut feed: Option<ChangeFeed>, settings: FeedSettings) {
    let mut backoff = Backoff::new(&settings);

    loop {
        if let Some(mut active) = feed.take() {
            let reason = loop {
                match active.next().await {
                    Ok(change) => {
                        let Some(consumer) = consumer.upgrade() else {
                            return;
                        };
                        consumer.route(change).await;
                    }
                    Err(reason) => break reason,
                }
            };

            let Some(consumer) = consumer.upgrade() else {
                return;
            };
            match reason {
                FeedError::Lagged(missed) => {
                    warn!(event_id = %consumer.event_id, missed, "Change feed lagged, resyncing")
                }
                FeedError::Closed => warn!(event_id = %consumer.event_id, "Change feed closed"),
            }
            consumer.hub.set_feed_status(FeedStatus::Reconnecting);
        }

        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;

        let Some(consumer) = consumer.upgrade() else {
            return;
        };
        match consumer.reconnect().await {
            Ok(reattached) => {
                backoff.reset();
                feed = Some(reattached);
                consumer.hub.set_feed_status(FeedStatus::Live);
            }
            Err(e) => {
                warn!(
                    event_id = %consumer.event_id,
                    retry_in_ms = backoff.next.as_millis() as u64,
                    "Reconnect failed: {}", e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteScoreStore;
    use chrono::Utc;
    use judging_common::model::{CriterionDoc, ScoringConfigDoc};
    use judging_common::{ChangeKind, RawValue, TrackDefinition};

    fn track(track_id: &str) -> TrackDefinition {
        TrackDefinition {
            event_id: "ev".to_string(),
            track_id: track_id.to_string(),
            name: track_id.to_string(),
            scoring: Some(ScoringConfigDoc {
                name: track_id.to_string(),
                criteria: vec![CriterionDoc {
                    id: "tech".to_string(),
                    weight: Some(1.0),
                    min: Some(0.0),
                    max: Some(10.0),
                    ..Default::default()
                }],
            }),
        }
    }

    fn score(track_id: &str, project: &str, judge: &str, tech: f64) -> ScoreRecord {
        ScoreRecord {
            project_id: project.to_string(),
            judge_id: judge.to_string(),
            track_id: track_id.to_string(),
            event_id: "ev".to_string(),
            scores: [("tech".to_string(), RawValue::Number(tech))].into_iter().collect(),
            comments: None,
            updated_at: Utc::now(),
        }
    }

    async fn consumer_with_scores() -> (tempfile::TempDir, Arc<EventConsumer>) {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteScoreStore::open(&dir.path().join("judging.db"), 64)
            .await
            .unwrap();
        sqlite.upsert_track(&track("web")).await.unwrap();
        sqlite.upsert_track(&track("mobile")).await.unwrap();
        for record in [
            score("web", "P", "J1", 4.0),
            score("web", "P", "J2", 6.0),
            score("mobile", "Q", "J1", 9.0),
        ] {
            sqlite.upsert_score_record(record).await.unwrap();
        }

        let store: Arc<dyn ScoreStore> = Arc::new(sqlite);
        let resolver = Arc::new(TrackConfigResolver::new(store.clone()));
        let consumer = EventConsumer::start(
            "ev",
            store,
            resolver,
            &EngineSettings::default(),
            &FeedSettings::default(),
        )
        .await
        .unwrap();
        (dir, consumer)
    }

    async fn kill_actor(consumer: &EventConsumer, track_id: &str) {
        let handle = {
            let actors = lock(&consumer.actors);
            let running = actors.get(track_id).unwrap();
            running.task.abort();
            running.handle.clone()
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_actor_is_rebuilt_on_next_change() {
        let (_dir, consumer) = consumer_with_scores().await;
        kill_actor(&consumer, "web").await;

        // not in the store: only the routed change adds J3
        consumer
            .route(ScoreChange::new(ChangeKind::Insert, score("web", "P", "J3", 8.0)))
            .await;

        let board = consumer.actor("web").await.unwrap().snapshot().await.unwrap();
        assert_eq!(board.entries.len(), 1);
        assert_eq!(board.entries[0].judge_count, 3);
        assert_eq!(board.entries[0].average_score, 6.0);

        let mobile = consumer.actor("mobile").await.unwrap().snapshot().await.unwrap();
        assert_eq!(mobile.entries[0].project_id, "Q");
        assert_eq!(mobile.entries[0].average_score, 9.0);
    }

    #[tokio::test]
    async fn test_stopped_actor_is_rebuilt_on_read() {
        let (_dir, consumer) = consumer_with_scores().await;
        kill_actor(&consumer, "web").await;

        let boards = consumer.leaderboards().await.unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].track_id, "mobile");

        let board = consumer.actor("web").await.unwrap().snapshot().await.unwrap();
        assert_eq!(board.entries[0].judge_count, 2);
        assert_eq!(board.entries[0].average_score, 5.0);
        assert_eq!(consumer.track_count(), 2);
    }

    #[test]
    fn test_backoff_grows_to_max_and_resets() {
        let settings = FeedSettings {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::new(&settings);

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_never_shrinks() {
        let settings = FeedSettings {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            backoff_multiplier: 0.5,
        };
        let mut backoff = Backoff::new(&settings);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
