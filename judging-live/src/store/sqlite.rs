//! SQLite-backed score store
//!
//! Stands in for the hosted store so the service runs standalone: durable
//! upsert/delete keyed on (project, judge, track), snapshot listing, and a
//! broadcast change feed fed by this process's own writes.
//!
//! The store orders writes per key. A delete leaves a tombstone holding the
//! timestamp it was published with, and any later write older than that
//! tombstone is refused, exactly as the aggregates discard it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ChangeFeed, ScoreStore};
use crate::error::Result;
use judging_common::model::ScoringConfigDoc;
use judging_common::{ChangeKind, ProjectMeta, RawValue, ScoreChange, ScoreKey, ScoreRecord, TrackDefinition};

type ScoreRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
);

const SELECT_SCORE_COLUMNS: &str =
    "SELECT project_id, judge_id, track_id, event_id, scores, comments, updated_at FROM project_scores";

/// Score store on a SQLite database
#[derive(Clone)]
pub struct SqliteScoreStore {
    pool: SqlitePool,
    changes: broadcast::Sender<ScoreChange>,
}

impl SqliteScoreStore {
    /// Open (creating if needed) the database file and its schema
    pub async fn open(db_path: &Path, change_buffer: usize) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::Error::Internal(format!("create {}: {}", parent.display(), e)))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        // WAL lets snapshot reads run alongside score writes
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        Self::from_pool(pool, change_buffer).await
    }

    /// Wrap an existing pool, creating tables if needed
    pub async fn from_pool(pool: SqlitePool, change_buffer: usize) -> Result<Self> {
        init_schema(&pool).await?;
        let (changes, _) = broadcast::channel(change_buffer);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create or replace a track (organizer tooling path)
    pub async fn upsert_track(&self, track: &TrackDefinition) -> Result<()> {
        let scoring = track
            .scoring
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO event_tracks (event_id, track_id, name, scoring_config) VALUES (?, ?, ?, ?)
             ON CONFLICT(event_id, track_id) DO UPDATE SET
                name = excluded.name, scoring_config = excluded.scoring_config",
        )
        .bind(&track.event_id)
        .bind(&track.track_id)
        .bind(&track.name)
        .bind(scoring)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create or replace a project's display metadata
    pub async fn upsert_project(&self, event_id: &str, project: &ProjectMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (project_id, event_id, project_name, lead_name) VALUES (?, ?, ?, ?)
             ON CONFLICT(project_id) DO UPDATE SET
                event_id = excluded.event_id,
                project_name = excluded.project_name,
                lead_name = excluded.lead_name",
        )
        .bind(&project.project_id)
        .bind(event_id)
        .bind(&project.project_name)
        .bind(&project.lead_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn project_meta(&self, project_id: &str) -> Result<Option<ProjectMeta>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT project_id, project_name, lead_name FROM projects WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(project_id, project_name, lead_name)| ProjectMeta {
            project_id,
            project_name,
            lead_name,
        }))
    }

    async fn publish(&self, kind: ChangeKind, record: ScoreRecord) -> Result<()> {
        let project = self.project_meta(&record.project_id).await?;
        debug!(
            event_id = %record.event_id,
            track_id = %record.track_id,
            project_id = %record.project_id,
            judge_id = %record.judge_id,
            ?kind,
            "Publishing score change"
        );
        // No receivers is fine: nobody is watching this event yet
        let _ = self.changes.send(ScoreChange {
            kind,
            record,
            project,
        });
        Ok(())
    }
}

#[async_trait]
impl ScoreStore for SqliteScoreStore {
    async fn get_track_config(&self, event_id: &str, track_id: &str) -> Result<Option<TrackDefinition>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT event_id, track_id, name, scoring_config FROM event_tracks
             WHERE event_id = ? AND track_id = ?",
        )
        .bind(event_id)
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(track_from_row))
    }

    async fn list_tracks(&self, event_id: &str) -> Result<Vec<TrackDefinition>> {
        let rows = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT event_id, track_id, name, scoring_config FROM event_tracks
             WHERE event_id = ? ORDER BY track_id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(track_from_row).collect())
    }

    async fn list_projects(&self, event_id: &str) -> Result<Vec<ProjectMeta>> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT project_id, project_name, lead_name FROM projects WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(project_id, project_name, lead_name)| ProjectMeta {
                project_id,
                project_name,
                lead_name,
            })
            .collect())
    }

    async fn list_score_records(&self, event_id: &str) -> Result<Vec<ScoreRecord>> {
        let rows = sqlx::query_as::<_, ScoreRow>(&format!(
            "{} WHERE event_id = ? ORDER BY track_id, project_id, judge_id",
            SELECT_SCORE_COLUMNS
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(record_from_row).collect())
    }

    async fn subscribe_score_changes(&self, event_id: &str) -> Result<ChangeFeed> {
        Ok(ChangeFeed::new(event_id, self.changes.subscribe()))
    }

    async fn upsert_score_record(&self, record: ScoreRecord) -> Result<Option<ChangeKind>> {
        let scores = serde_json::to_string(&record.scores)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT updated_at FROM project_scores
             WHERE project_id = ? AND judge_id = ? AND track_id = ?",
        )
        .bind(&record.project_id)
        .bind(&record.judge_id)
        .bind(&record.track_id)
        .fetch_optional(&mut *tx)
        .await?;

        let deleted_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT deleted_at FROM score_tombstones
             WHERE project_id = ? AND judge_id = ? AND track_id = ?",
        )
        .bind(&record.project_id)
        .bind(&record.judge_id)
        .bind(&record.track_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(last) = existing.max(deleted_at) {
            if last > record.updated_at {
                warn!(
                    project_id = %record.project_id,
                    judge_id = %record.judge_id,
                    track_id = %record.track_id,
                    deleted = existing.is_none(),
                    "Ignoring score write older than the stored row"
                );
                return Ok(None);
            }
        }

        if deleted_at.is_some() {
            sqlx::query(
                "DELETE FROM score_tombstones WHERE project_id = ? AND judge_id = ? AND track_id = ?",
            )
            .bind(&record.project_id)
            .bind(&record.judge_id)
            .bind(&record.track_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO project_scores
                (project_id, judge_id, track_id, event_id, scores, comments, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_id, judge_id, track_id) DO UPDATE SET
                event_id = excluded.event_id,
                scores = excluded.scores,
                comments = excluded.comments,
                updated_at = excluded.updated_at",
        )
        .bind(&record.project_id)
        .bind(&record.judge_id)
        .bind(&record.track_id)
        .bind(&record.event_id)
        .bind(scores)
        .bind(&record.comments)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let kind = if existing.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.publish(kind, record).await?;
        Ok(Some(kind))
    }

    async fn delete_score_record(&self, event_id: &str, key: &ScoreKey) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ScoreRow>(&format!(
            "{} WHERE project_id = ? AND judge_id = ? AND track_id = ? AND event_id = ?",
            SELECT_SCORE_COLUMNS
        ))
        .bind(&key.project_id)
        .bind(&key.judge_id)
        .bind(&key.track_id)
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        sqlx::query(
            "DELETE FROM project_scores WHERE project_id = ? AND judge_id = ? AND track_id = ?",
        )
        .bind(&key.project_id)
        .bind(&key.judge_id)
        .bind(&key.track_id)
        .execute(&mut *tx)
        .await?;

        let mut record = record_from_row(row);
        // The delete must order after the write it removes
        record.updated_at = record.updated_at.max(Utc::now());

        sqlx::query(
            "INSERT INTO score_tombstones (project_id, judge_id, track_id, event_id, deleted_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(project_id, judge_id, track_id) DO UPDATE SET
                event_id = excluded.event_id,
                deleted_at = excluded.deleted_at",
        )
        .bind(&key.project_id)
        .bind(&key.judge_id)
        .bind(&key.track_id)
        .bind(event_id)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.publish(ChangeKind::Delete, record).await?;
        Ok(true)
    }
}

/// Create tables (idempotent)
async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_tracks (
            event_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            scoring_config TEXT,
            PRIMARY KEY (event_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            project_id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            project_name TEXT NOT NULL DEFAULT '',
            lead_name TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_scores (
            project_id TEXT NOT NULL,
            judge_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            scores TEXT NOT NULL DEFAULT '{}',
            comments TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (project_id, judge_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_project_scores_event ON project_scores(event_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS score_tombstones (
            project_id TEXT NOT NULL,
            judge_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            PRIMARY KEY (project_id, judge_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn track_from_row(row: (String, String, String, Option<String>)) -> TrackDefinition {
    let (event_id, track_id, name, scoring_config) = row;
    let scoring = scoring_config.and_then(|json| {
        match serde_json::from_str::<ScoringConfigDoc>(&json) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(%event_id, %track_id, "Unreadable scoring config, using default template: {}", e);
                None
            }
        }
    });

    TrackDefinition {
        event_id,
        track_id,
        name,
        scoring,
    }
}

fn record_from_row(row: ScoreRow) -> ScoreRecord {
    let (project_id, judge_id, track_id, event_id, scores_json, comments, updated_at) = row;
    let scores = match serde_json::from_str::<BTreeMap<String, RawValue>>(&scores_json) {
        Ok(scores) => scores,
        Err(e) => {
            // Counted as a submission with no recognized criteria
            warn!(%project_id, %judge_id, %track_id, "Unreadable scores column: {}", e);
            BTreeMap::new()
        }
    };

    ScoreRecord {
        project_id,
        judge_id,
        track_id,
        event_id,
        scores,
        comments,
        updated_at,
    }
}
