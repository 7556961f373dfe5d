//! Aggregation state for one (event, track)
//!
//! Each project keeps a running `total_weighted_score` and `judge_count`,
//! plus the exact contribution of every judge. Updates and deletes replace
//! or remove that judge's contribution, so redelivered or reordered change
//! events converge on the same state as a full rescan.
//!
//! Totals are accumulated in fixed-point score units (see [`SCORE_UNITS`]).
//! Integer sums do not depend on the order judges arrive in, so an
//! incremental total is bit-identical to a rebuilt one.
//!
//! The state is owned by a single track actor and is never shared.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use judging_common::{ChangeKind, ProjectMeta, ScoreChange, ScoreRecord, TrackConfig};

/// A submission with no recognized criteria still counts as a review
///
/// It contributes 0 to the total and increments `judge_count`.
pub const EMPTY_SUBMISSION_COUNTS_AS_JUDGE: bool = true;

/// Fixed-point units per score point (six decimal places)
pub const SCORE_UNITS: i64 = 1_000_000;

fn to_units(value: f64) -> i64 {
    (value * SCORE_UNITS as f64).round() as i64
}

fn from_units(units: i64) -> f64 {
    units as f64 / SCORE_UNITS as f64
}

/// `units / (count × SCORE_UNITS)` as one correctly rounded division
fn mean_of_units(units: i64, count: u32) -> f64 {
    units as f64 / (count as f64 * SCORE_UNITS as f64)
}

/// One record evaluated against a track config
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Σ value × weight over recognized criteria
    pub weighted_total: f64,
    /// In-domain values of numeric criteria
    pub numeric: BTreeMap<String, f64>,
    /// Selected option index of multiple-choice criteria
    pub choices: BTreeMap<String, usize>,
    /// Criterion ids not in the config, or with uninterpretable values
    pub ignored: Vec<String>,
    /// Criterion ids whose value was clamped into the domain
    pub clamped: Vec<String>,
}

impl Evaluation {
    pub fn recognized(&self) -> usize {
        self.numeric.len() + self.choices.len()
    }
}

/// Evaluate a record's criteria in config order
pub fn evaluate(record: &ScoreRecord, config: &TrackConfig) -> Evaluation {
    let mut evaluation = Evaluation::default();

    for criterion in &config.criteria {
        let Some(raw) = record.scores.get(&criterion.id) else {
            continue;
        };
        let Some(domain_value) = criterion.to_domain(raw) else {
            evaluation.ignored.push(criterion.id.clone());
            continue;
        };
        if domain_value.clamped {
            evaluation.clamped.push(criterion.id.clone());
        }

        evaluation.weighted_total += domain_value.value * criterion.weight;
        if criterion.is_multiple_choice() {
            evaluation
                .choices
                .insert(criterion.id.clone(), domain_value.value as usize);
        } else {
            evaluation.numeric.insert(criterion.id.clone(), domain_value.value);
        }
    }

    for id in record.scores.keys() {
        if config.criterion(id).is_none() {
            evaluation.ignored.push(id.clone());
        }
    }

    evaluation
}

/// `Σ record.scores[c] × c.weight` over the config's criteria present in the record
pub fn weighted_total(record: &ScoreRecord, config: &TrackConfig) -> f64 {
    evaluate(record, config).weighted_total
}

/// What an applied change did to the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Older than the judge's currently applied write; discarded
    Stale,
    /// Nothing to do (delete of an absent score, misrouted record)
    Ignored,
}

/// Result of [`TrackAggregate::apply`]
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDelta {
    pub project_id: String,
    pub judge_id: String,
    pub outcome: DeltaOutcome,
    pub total_delta: f64,
    pub judge_count_delta: i32,
}

impl AggregateDelta {
    fn none(record: &ScoreRecord, outcome: DeltaOutcome) -> Self {
        Self {
            project_id: record.project_id.clone(),
            judge_id: record.judge_id.clone(),
            outcome,
            total_delta: 0.0,
            judge_count_delta: 0,
        }
    }

    /// True when the aggregate was modified
    pub fn changed(&self) -> bool {
        matches!(
            self.outcome,
            DeltaOutcome::Inserted | DeltaOutcome::Updated | DeltaOutcome::Deleted
        )
    }
}

#[derive(Debug, Clone)]
struct Contribution {
    updated_at: DateTime<Utc>,
    evaluation: Evaluation,
    counted: bool,
}

impl Contribution {
    fn units(&self) -> i64 {
        if self.counted {
            to_units(self.evaluation.weighted_total)
        } else {
            0
        }
    }

    fn judges(&self) -> i32 {
        i32::from(self.counted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CriterionTotal {
    units: i64,
    count: u32,
}

/// Running aggregate of one project in one track
#[derive(Debug, Clone, Default)]
pub struct ProjectAggregate {
    pub project_id: String,
    pub project_name: String,
    pub lead_name: String,
    total_units: i64,
    judge_count: u32,
    contributions: HashMap<String, Contribution>,
    /// Deletion time per judge, so older redelivered writes stay deleted
    tombstones: HashMap<String, DateTime<Utc>>,
    criterion_totals: BTreeMap<String, CriterionTotal>,
    choice_counts: BTreeMap<String, BTreeMap<usize, u32>>,
}

impl ProjectAggregate {
    fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Default::default()
        }
    }

    pub fn total_weighted_score(&self) -> f64 {
        from_units(self.total_units)
    }

    pub fn judge_count(&self) -> u32 {
        self.judge_count
    }

    /// `total / judge_count`; `None` while no judge has scored
    pub fn average_score(&self) -> Option<f64> {
        (self.judge_count > 0).then(|| mean_of_units(self.total_units, self.judge_count))
    }

    /// Weighted total currently held for a judge
    pub fn contribution(&self, judge_id: &str) -> Option<f64> {
        self.contributions.get(judge_id).map(|c| from_units(c.units()))
    }

    /// Mean raw value per numeric criterion over the judges who scored it
    pub fn criterion_averages(&self) -> BTreeMap<String, f64> {
        self.criterion_totals
            .iter()
            .filter(|(_, t)| t.count > 0)
            .map(|(id, t)| (id.clone(), mean_of_units(t.units, t.count)))
            .collect()
    }

    /// Selection count per option index, per multiple-choice criterion
    pub fn choice_counts(&self) -> &BTreeMap<String, BTreeMap<usize, u32>> {
        &self.choice_counts
    }

    fn set_meta(&mut self, meta: &ProjectMeta) {
        if !meta.project_name.is_empty() {
            self.project_name = meta.project_name.clone();
        }
        if !meta.lead_name.is_empty() {
            self.lead_name = meta.lead_name.clone();
        }
    }

    /// Latest write time seen for a judge, live or deleted
    fn last_applied(&self, judge_id: &str) -> Option<DateTime<Utc>> {
        let live = self.contributions.get(judge_id).map(|c| c.updated_at);
        let deleted = self.tombstones.get(judge_id).copied();
        live.max(deleted)
    }

    /// Install or replace a judge's contribution; returns (total delta, judge delta, replaced)
    fn put(&mut self, judge_id: &str, contribution: Contribution) -> (f64, i32, bool) {
        self.tombstones.remove(judge_id);
        let new_units = contribution.units();
        let new_judges = contribution.judges();
        self.add_breakdown(&contribution.evaluation, 1);

        let (old_units, old_judges, replaced) =
            match self.contributions.insert(judge_id.to_string(), contribution) {
                Some(old) => {
                    self.add_breakdown(&old.evaluation, -1);
                    (old.units(), old.judges(), true)
                }
                None => (0, 0, false),
            };

        let units_delta = new_units - old_units;
        let judge_delta = new_judges - old_judges;
        self.adjust(units_delta, judge_delta);
        (from_units(units_delta), judge_delta, replaced)
    }

    /// Remove a judge's contribution; returns (total delta, judge delta)
    fn remove(&mut self, judge_id: &str, deleted_at: DateTime<Utc>) -> Option<(f64, i32)> {
        self.tombstones.insert(judge_id.to_string(), deleted_at);
        let old = self.contributions.remove(judge_id)?;
        self.add_breakdown(&old.evaluation, -1);

        let units_delta = -old.units();
        let judge_delta = -old.judges();
        self.adjust(units_delta, judge_delta);
        Some((from_units(units_delta), judge_delta))
    }

    fn adjust(&mut self, units_delta: i64, judge_delta: i32) {
        self.total_units += units_delta;
        self.judge_count = (self.judge_count as i64 + judge_delta as i64).max(0) as u32;
    }

    fn add_breakdown(&mut self, evaluation: &Evaluation, sign: i32) {
        for (id, value) in &evaluation.numeric {
            let entry = self.criterion_totals.entry(id.clone()).or_default();
            entry.units += to_units(*value) * sign as i64;
            entry.count = (entry.count as i64 + sign as i64).max(0) as u32;
            if entry.count == 0 {
                self.criterion_totals.remove(id);
            }
        }
        for (id, option) in &evaluation.choices {
            let options = self.choice_counts.entry(id.clone()).or_default();
            let count = options.entry(*option).or_default();
            *count = (*count as i64 + sign as i64).max(0) as u32;
            if *count == 0 {
                options.remove(option);
            }
            if options.is_empty() {
                self.choice_counts.remove(id);
            }
        }
    }
}

/// All project aggregates of one track
#[derive(Debug, Clone)]
pub struct TrackAggregate {
    event_id: String,
    config: Arc<TrackConfig>,
    projects: BTreeMap<String, ProjectAggregate>,
}

impl TrackAggregate {
    pub fn new(event_id: &str, config: Arc<TrackConfig>) -> Self {
        Self {
            event_id: event_id.to_string(),
            config,
            projects: BTreeMap::new(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    pub fn project(&self, project_id: &str) -> Option<&ProjectAggregate> {
        self.projects.get(project_id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &ProjectAggregate> {
        self.projects.values()
    }

    /// Apply one change event
    pub fn apply(&mut self, change: &ScoreChange) -> AggregateDelta {
        let record = &change.record;
        if record.track_id != self.config.track_id || record.event_id != self.event_id {
            warn!(
                event_id = %record.event_id,
                track_id = %record.track_id,
                expected_track = %self.config.track_id,
                "Score routed to the wrong track, ignoring"
            );
            return AggregateDelta::none(record, DeltaOutcome::Ignored);
        }

        let project = self
            .projects
            .entry(record.project_id.clone())
            .or_insert_with(|| ProjectAggregate::new(&record.project_id));
        if let Some(meta) = &change.project {
            project.set_meta(meta);
        }

        if let Some(last) = project.last_applied(&record.judge_id) {
            if record.updated_at < last {
                debug!(
                    project_id = %record.project_id,
                    judge_id = %record.judge_id,
                    "Discarding stale score event"
                );
                return AggregateDelta::none(record, DeltaOutcome::Stale);
            }
        }

        match change.kind {
            ChangeKind::Delete => match project.remove(&record.judge_id, record.updated_at) {
                Some((total_delta, judge_count_delta)) => AggregateDelta {
                    project_id: record.project_id.clone(),
                    judge_id: record.judge_id.clone(),
                    outcome: DeltaOutcome::Deleted,
                    total_delta,
                    judge_count_delta,
                },
                None => AggregateDelta::none(record, DeltaOutcome::Ignored),
            },
            ChangeKind::Insert | ChangeKind::Update => {
                let evaluation = evaluate(record, &self.config);
                if !evaluation.ignored.is_empty() {
                    warn!(
                        track_id = %record.track_id,
                        project_id = %record.project_id,
                        judge_id = %record.judge_id,
                        criteria = ?evaluation.ignored,
                        "Ignoring unrecognized criteria"
                    );
                }
                if !evaluation.clamped.is_empty() {
                    warn!(
                        track_id = %record.track_id,
                        judge_id = %record.judge_id,
                        criteria = ?evaluation.clamped,
                        "Clamped out-of-domain values"
                    );
                }

                let counted = evaluation.recognized() > 0 || EMPTY_SUBMISSION_COUNTS_AS_JUDGE;
                let (total_delta, judge_count_delta, replaced) = project.put(
                    &record.judge_id,
                    Contribution {
                        updated_at: record.updated_at,
                        evaluation,
                        counted,
                    },
                );

                AggregateDelta {
                    project_id: record.project_id.clone(),
                    judge_id: record.judge_id.clone(),
                    outcome: if replaced {
                        DeltaOutcome::Updated
                    } else {
                        DeltaOutcome::Inserted
                    },
                    total_delta,
                    judge_count_delta,
                }
            }
        }
    }

    /// Replace all state with a snapshot, replayed as inserts
    ///
    /// Display metadata already known is kept for projects the snapshot
    /// does not describe.
    pub fn rebuild(&mut self, records: &[ScoreRecord], projects: &HashMap<String, ProjectMeta>) {
        let previous = std::mem::take(&mut self.projects);

        for record in records {
            let meta = projects.get(&record.project_id).cloned().or_else(|| {
                previous.get(&record.project_id).map(|p| ProjectMeta {
                    project_id: p.project_id.clone(),
                    project_name: p.project_name.clone(),
                    lead_name: p.lead_name.clone(),
                })
            });
            let change = ScoreChange {
                kind: ChangeKind::Insert,
                record: record.clone(),
                project: meta,
            };
            self.apply(&change);
        }
    }
}
