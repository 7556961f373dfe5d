//! Live judging engine
//!
//! Entry point for queries and subscriptions. Events are loaded lazily on
//! first use (snapshot, actors, feed) and evicted by a background reaper
//! once they have had no subscribers for the grace period and no score
//! activity for the idle timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broadcaster::LeaderboardSubscription;
use crate::config::{EngineSettings, FeedSettings};
use crate::error::Result;
use crate::feed::EventConsumer;
use crate::ranking::ProjectBreakdown;
use crate::resolver::TrackConfigResolver;
use crate::store::ScoreStore;
use judging_common::{LeaderboardEvent, TrackLeaderboard};

type EventSlot = Arc<OnceCell<Arc<EventConsumer>>>;

/// Leaderboards of every event served by this process
pub struct JudgingEngine {
    store: Arc<dyn ScoreStore>,
    resolver: Arc<TrackConfigResolver>,
    settings: EngineSettings,
    feed_settings: FeedSettings,
    events: Mutex<HashMap<String, EventSlot>>,
}

impl JudgingEngine {
    pub fn new(store: Arc<dyn ScoreStore>, settings: EngineSettings, feed_settings: FeedSettings) -> Arc<Self> {
        Arc::new(Self {
            resolver: Arc::new(TrackConfigResolver::new(store.clone())),
            store,
            settings,
            feed_settings,
            events: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EventSlot>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loaded runtime of an event; concurrent first callers share one load
    async fn event(&self, event_id: &str) -> Result<Arc<EventConsumer>> {
        let slot = self.lock().entry(event_id.to_string()).or_default().clone();

        let loaded = slot
            .get_or_try_init(|| {
                EventConsumer::start(
                    event_id,
                    self.store.clone(),
                    self.resolver.clone(),
                    &self.settings,
                    &self.feed_settings,
                )
            })
            .await;

        match loaded {
            Ok(consumer) => {
                consumer.touch();
                Ok(consumer.clone())
            }
            Err(e) => {
                self.discard_failed_slot(event_id, &slot);
                Err(e)
            }
        }
    }

    /// Forget a slot whose load failed, unless another caller is still waiting on it
    fn discard_failed_slot(&self, event_id: &str, slot: &EventSlot) {
        let mut events = self.lock();
        let unused = events
            .get(event_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized())
            && Arc::strong_count(slot) <= 2;
        if unused {
            events.remove(event_id);
            debug!(event_id, "Discarded failed event load");
        }
    }

    /// `GetLeaderboard`: current ranking of one track
    ///
    /// Unknown tracks are `ConfigNotFound`; a known track without scores
    /// has an empty ranking.
    pub async fn get_leaderboard(&self, event_id: &str, track_id: &str) -> Result<TrackLeaderboard> {
        let consumer = self.event(event_id).await?;
        let handle = consumer.actor(track_id).await?;
        handle.snapshot().await
    }

    /// Current ranking of every track of the event
    pub async fn get_event_leaderboards(&self, event_id: &str) -> Result<Vec<TrackLeaderboard>> {
        let consumer = self.event(event_id).await?;
        consumer.leaderboards().await
    }

    /// Top `top` entries of every track
    pub async fn winners(&self, event_id: &str, top: usize) -> Result<Vec<TrackLeaderboard>> {
        let mut boards = self.get_event_leaderboards(event_id).await?;
        for board in &mut boards {
            board.entries.truncate(top);
        }
        Ok(boards)
    }

    /// Per-criterion averages of one track's ranked projects
    pub async fn breakdown(&self, event_id: &str, track_id: &str) -> Result<Vec<ProjectBreakdown>> {
        let consumer = self.event(event_id).await?;
        let handle = consumer.actor(track_id).await?;
        handle.breakdown().await
    }

    /// `Subscribe`: the current feed status and every track's ranking are
    /// queued before any live update
    pub async fn subscribe(&self, event_id: &str) -> Result<LeaderboardSubscription> {
        loop {
            let consumer = self.event(event_id).await?;
            // a hub closed by a concurrent eviction: load the event again
            let Some(subscription) = consumer.hub().subscribe() else {
                continue;
            };

            for board in consumer.leaderboards().await? {
                subscription.push(LeaderboardEvent::from_leaderboard(board));
            }
            return Ok(subscription);
        }
    }

    /// Ids of the events currently loaded
    pub fn loaded_events(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Events whose first load is still in flight
    pub fn pending_events(&self) -> usize {
        self.lock().values().filter(|slot| !slot.initialized()).count()
    }

    /// Subscriber count of a loaded event
    pub fn subscriber_count(&self, event_id: &str) -> usize {
        self.lock()
            .get(event_id)
            .and_then(|slot| slot.get())
            .map(|consumer| consumer.hub().subscriber_count())
            .unwrap_or(0)
    }

    /// Evict events with no subscribers past the grace period and no
    /// score activity past the idle timeout
    pub fn evict_idle(&self) -> Vec<String> {
        let grace = self.settings.grace_period();
        let idle = self.settings.idle_timeout();

        let mut evicted = Vec::new();
        {
            let mut events = self.lock();
            events.retain(|event_id, slot| {
                let Some(consumer) = slot.get() else {
                    // kept only while a load holds the slot
                    return Arc::strong_count(slot) > 1;
                };
                if consumer.idle_for() < idle || !consumer.hub().close_if_unsubscribed(grace) {
                    return true;
                }
                evicted.push(event_id.clone());
                false
            });
        }

        for event_id in &evicted {
            self.resolver.forget_event(event_id);
            info!(event_id = %event_id, "Evicted idle event");
        }
        evicted
    }

    /// Periodically run [`evict_idle`](Self::evict_idle) until the engine is dropped
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let interval = self.settings.eviction_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let evicted = engine.evict_idle();
                debug!(
                    evicted = evicted.len(),
                    loaded = engine.loaded_events().len(),
                    pending = engine.pending_events(),
                    "Reaper pass"
                );
            }
        })
    }
}
