//! Per-event subscription hub
//!
//! Fans leaderboard events out to dashboard subscribers. Each subscriber
//! has its own bounded queue, so a slow client never blocks a track actor
//! or any other subscriber. On overflow the queue coalesces: intermediate
//! rankings of a track are dropped, and only the newest ranking per track
//! plus the newest feed status survive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use futures::Stream;
use judging_common::{FeedStatus, LeaderboardEvent};

/// Outcome of offering an event to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after dropping superseded events
    Coalesced,
    /// Older than a ranking the subscriber already has; dropped
    Outdated,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<LeaderboardEvent>,
    /// Highest ranking version accepted per track
    versions: HashMap<String, u64>,
    overflows: u64,
    closed: bool,
}

/// Bounded push queue of one subscriber
#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: LeaderboardEvent) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        if let Some((track_id, version)) = event.track_version() {
            if state.versions.get(track_id).is_some_and(|seen| *seen >= version) {
                return PushOutcome::Outdated;
            }
            state.versions.insert(track_id.to_string(), version);
        }

        state.pending.push_back(event);
        let outcome = if state.pending.len() > self.capacity {
            coalesce(&mut state.pending);
            state.overflows += 1;
            PushOutcome::Coalesced
        } else {
            PushOutcome::Queued
        };
        drop(state);

        self.notify.notify_one();
        outcome
    }

    fn pop(&self) -> Option<LeaderboardEvent> {
        self.lock().pending.pop_front()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn overflows(&self) -> u64 {
        self.lock().overflows
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Keep only the newest ranking per track and the newest feed status
fn coalesce(pending: &mut VecDeque<LeaderboardEvent>) {
    let mut seen: HashSet<Option<String>> = HashSet::new();
    let mut kept: VecDeque<LeaderboardEvent> = VecDeque::with_capacity(pending.len());

    while let Some(event) = pending.pop_back() {
        let key = event.track_version().map(|(track_id, _)| track_id.to_string());
        if seen.insert(key) {
            kept.push_front(event);
        }
    }
    *pending = kept;
}

struct HubState {
    subscribers: HashMap<Uuid, Arc<SubscriberQueue>>,
    feed_status: FeedStatus,
    /// Set when the last subscriber left (or at creation)
    unsubscribed_since: Option<Instant>,
    closed: bool,
}

struct HubInner {
    event_id: String,
    queue_capacity: usize,
    versions: AtomicU64,
    state: Mutex<HubState>,
}

/// Subscription hub of one event; cheap to clone
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(event_id: &str, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                event_id: event_id.to_string(),
                queue_capacity,
                versions: AtomicU64::new(0),
                state: Mutex::new(HubState {
                    subscribers: HashMap::new(),
                    feed_status: FeedStatus::Live,
                    unsubscribed_since: Some(Instant::now()),
                    closed: false,
                }),
            }),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.inner.event_id
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next ranking version; shared by every track of the event so a
    /// restarted actor never reuses a version
    pub fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a subscriber
    ///
    /// The current feed status is queued first. Returns `None` once the hub
    /// has been closed by eviction.
    pub fn subscribe(&self) -> Option<LeaderboardSubscription> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.inner.queue_capacity));
        queue.push(LeaderboardEvent::feed_status(&self.inner.event_id, state.feed_status));
        state.subscribers.insert(id, queue.clone());
        state.unsubscribed_since = None;

        info!(
            event_id = %self.inner.event_id,
            subscriber = %id,
            subscribers = state.subscribers.len(),
            "Leaderboard subscriber attached"
        );

        Some(LeaderboardSubscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        })
    }

    fn unsubscribe(&self, id: Uuid) {
        let mut state = self.lock();
        if let Some(queue) = state.subscribers.remove(&id) {
            queue.close();
            let dropped = queue.overflows();
            if state.subscribers.is_empty() {
                state.unsubscribed_since = Some(Instant::now());
            }
            info!(
                event_id = %self.inner.event_id,
                subscriber = %id,
                overflows = dropped,
                subscribers = state.subscribers.len(),
                "Leaderboard subscriber detached"
            );
        }
    }

    /// Offer an event to every subscriber without blocking
    pub fn publish(&self, event: LeaderboardEvent) {
        let state = self.lock();
        for (id, queue) in &state.subscribers {
            match queue.push(event.clone()) {
                PushOutcome::Coalesced => {
                    warn!(
                        event_id = %self.inner.event_id,
                        subscriber = %id,
                        "Subscriber backpressure, coalesced pending updates"
                    );
                }
                PushOutcome::Outdated => {
                    debug!(subscriber = %id, "Dropped outdated ranking");
                }
                PushOutcome::Queued | PushOutcome::Closed => {}
            }
        }
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.lock().feed_status
    }

    /// Record a feed status; notifies subscribers on transitions only
    pub fn set_feed_status(&self, status: FeedStatus) -> bool {
        {
            let mut state = self.lock();
            if state.feed_status == status {
                return false;
            }
            state.feed_status = status;
        }

        match status {
            FeedStatus::Live => info!(event_id = %self.inner.event_id, "Change feed live"),
            FeedStatus::Reconnecting => {
                warn!(event_id = %self.inner.event_id, "Change feed reconnecting")
            }
        }
        self.publish(LeaderboardEvent::feed_status(&self.inner.event_id, status));
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Time since the last subscriber left; `None` while any is attached
    pub fn unsubscribed_for(&self) -> Option<Duration> {
        self.lock().unsubscribed_since.map(|since| since.elapsed())
    }

    /// Close the hub if it has had no subscribers for at least `grace`
    ///
    /// A closed hub refuses new subscribers; checked and set atomically so
    /// a subscriber can never attach to an evicted event.
    pub fn close_if_unsubscribed(&self, grace: Duration) -> bool {
        let mut state = self.lock();
        let idle = state.subscribers.is_empty()
            && state.unsubscribed_since.is_some_and(|since| since.elapsed() >= grace);
        if idle {
            state.closed = true;
        }
        idle
    }

    /// Close the hub and end every subscription
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for (_, queue) in state.subscribers.drain() {
            queue.close();
        }
    }
}

/// One dashboard's view of an event's leaderboard events
///
/// Dropping the subscription detaches it from the hub.
pub struct LeaderboardSubscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubInner>,
}

impl LeaderboardSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an event for this subscriber only (initial snapshots)
    pub fn push(&self, event: LeaderboardEvent) -> PushOutcome {
        self.queue.push(event)
    }

    /// Next event; `None` once the hub has closed the subscription
    pub async fn recv(&mut self) -> Option<LeaderboardEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<LeaderboardEvent> {
        self.queue.pop()
    }

    /// Times this subscriber's queue overflowed and was coalesced
    pub fn overflows(&self) -> u64 {
        self.queue.overflows()
    }

    pub fn into_stream(self) -> impl Stream<Item = LeaderboardEvent> + Send + 'static {
        async_stream::stream! {
            let mut subscription = self;
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for LeaderboardSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            SubscriptionHub { inner }.unsubscribe(self.id);
        }
    }
}
