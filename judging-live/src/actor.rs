//! Track aggregation actor
//!
//! One task per (event, track) owns that track's [`TrackAggregate`] and
//! processes commands strictly in order. No other task touches the
//! aggregate, so applying a change needs no locking. After each command the
//! ranking is recomputed; a changed ranking is published to the event's
//! subscription hub under a fresh version.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::TrackAggregate;
use crate::broadcaster::SubscriptionHub;
use crate::error::{Error, Result};
use crate::ranking::{self, ProjectBreakdown};
use judging_common::{
    LeaderboardEvent, ProjectMeta, RankedEntry, ScoreChange, ScoreRecord, TrackConfig,
    TrackLeaderboard,
};

/// Commands accepted by a track actor
pub(crate) enum TrackCommand {
    Apply(ScoreChange),
    /// Replace all state with a snapshot of the track's records
    Resync {
        records: Vec<ScoreRecord>,
        projects: Arc<HashMap<String, ProjectMeta>>,
    },
    Snapshot(oneshot::Sender<TrackLeaderboard>),
    Breakdown(oneshot::Sender<Vec<ProjectBreakdown>>),
}

/// Sending side of a track actor's mailbox
#[derive(Clone)]
pub struct TrackHandle {
    track_id: String,
    tx: mpsc::Sender<TrackCommand>,
}

impl TrackHandle {
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// The actor has stopped and will accept no more commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn apply(&self, change: ScoreChange) -> Result<()> {
        self.send(TrackCommand::Apply(change)).await
    }

    pub async fn resync(
        &self,
        records: Vec<ScoreRecord>,
        projects: Arc<HashMap<String, ProjectMeta>>,
    ) -> Result<()> {
        self.send(TrackCommand::Resync { records, projects }).await
    }

    /// Current ranking, after every command queued before this one
    pub async fn snapshot(&self) -> Result<TrackLeaderboard> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn breakdown(&self) -> Result<Vec<ProjectBreakdown>> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackCommand::Breakdown(tx)).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    async fn send(&self, command: TrackCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> Error {
        Error::ActorUnavailable(self.track_id.clone())
    }
}

/// Start the actor for one track
pub(crate) fn spawn_track_actor(
    event_id: &str,
    config: Arc<TrackConfig>,
    hub: SubscriptionHub,
    mailbox: usize,
) -> (TrackHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox.max(1));
    let handle = TrackHandle {
        track_id: config.track_id.clone(),
        tx,
    };

    let actor = TrackActor {
        version: hub.next_version(),
        aggregate: TrackAggregate::new(event_id, config),
        hub,
        ranking: Vec::new(),
    };
    let task = tokio::spawn(actor.run(rx));

    (handle, task)
}

struct TrackActor {
    aggregate: TrackAggregate,
    hub: SubscriptionHub,
    ranking: Vec<RankedEntry>,
    version: u64,
}

impl TrackActor {
    async fn run(mut self, mut rx: mpsc::Receiver<TrackCommand>) {
        info!(
            event_id = %self.aggregate.event_id(),
            track_id = %self.aggregate.config().track_id,
            "Track actor started"
        );

        while let Some(command) = rx.recv().await {
            self.handle(command);
        }

        info!(
            event_id = %self.aggregate.event_id(),
            track_id = %self.aggregate.config().track_id,
            "Track actor stopped"
        );
    }

    fn handle(&mut self, command: TrackCommand) {
        match command {
            TrackCommand::Apply(change) => {
                let delta = self.aggregate.apply(&change);
                debug!(
                    track_id = %self.aggregate.config().track_id,
                    project_id = %delta.project_id,
                    judge_id = %delta.judge_id,
                    outcome = ?delta.outcome,
                    total_delta = delta.total_delta,
                    judge_count_delta = delta.judge_count_delta,
                    "Applied score change"
                );
                if delta.changed() {
                    self.refresh_ranking();
                }
            }
            TrackCommand::Resync { records, projects } => {
                self.aggregate.rebuild(&records, &projects);
                debug!(
                    track_id = %self.aggregate.config().track_id,
                    records = records.len(),
                    "Track resynced from snapshot"
                );
                self.refresh_ranking();
            }
            TrackCommand::Snapshot(reply) => {
                if reply.send(self.leaderboard()).is_err() {
                    warn!("Snapshot requester went away");
                }
            }
            TrackCommand::Breakdown(reply) => {
                let _ = reply.send(ranking::breakdown(&self.aggregate));
            }
        }
    }

    /// Recompute the ranking; publish only when it changed
    fn refresh_ranking(&mut self) {
        let ranking = ranking::rank(self.aggregate.projects());
        if ranking == self.ranking {
            return;
        }

        self.ranking = ranking;
        self.version = self.hub.next_version();
        self.hub.publish(LeaderboardEvent::from_leaderboard(self.leaderboard()));
    }

    fn leaderboard(&self) -> TrackLeaderboard {
        let config = self.aggregate.config();
        TrackLeaderboard {
            event_id: self.aggregate.event_id().to_string(),
            track_id: config.track_id.clone(),
            track_name: config.name.clone(),
            feed_status: self.hub.feed_status(),
            version: self.version,
            entries: self.ranking.clone(),
        }
    }
}
