//! Scoring data model
//!
//! Types shared between the score store, the aggregation engine and API
//! clients. Stored documents (`ScoringConfigDoc`, `CriterionDoc`) keep the
//! loose shape the organizer tooling writes; [`TrackConfig`] is the
//! normalized form the engine aggregates against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::events::FeedStatus;
use crate::{Error, Result};

/// Numeric domain used when a criterion omits `min`
pub const DEFAULT_NUMERIC_MIN: f64 = 1.0;
/// Numeric domain used when a criterion omits `max`
pub const DEFAULT_NUMERIC_MAX: f64 = 10.0;
/// Points on a Likert scale when `likertScale` is omitted
pub const DEFAULT_LIKERT_POINTS: u32 = 5;
/// Weight applied when a criterion's weight is missing or zero
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Criteria used for tracks without an explicit scoring config
const DEFAULT_TEMPLATE: [(&str, &str); 4] = [
    ("technical", "Technical Implementation"),
    ("innovation", "Innovation"),
    ("impact", "Impact"),
    ("presentation", "Presentation"),
];

// ========================================
// Score records
// ========================================

/// Raw judge input for one criterion
///
/// Judges' clients submit numbers, but older forms stored the selected
/// option text for multiple-choice questions, so strings are accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// Unique key of a live score: one per judge, project and track
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreKey {
    pub project_id: String,
    pub judge_id: String,
    pub track_id: String,
}

/// One judge's evaluation of one project in one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub project_id: String,
    pub judge_id: String,
    pub track_id: String,
    pub event_id: String,
    /// Criterion id -> raw value. Always the judge's full submission.
    #[serde(default)]
    pub scores: BTreeMap<String, RawValue>,
    /// Free text, not used in aggregation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Commit time in the store; orders writes for the same key
    pub updated_at: DateTime<Utc>,
}

impl ScoreRecord {
    /// Key identifying the judge's live score
    pub fn key(&self) -> ScoreKey {
        ScoreKey {
            project_id: self.project_id.clone(),
            judge_id: self.judge_id.clone(),
            track_id: self.track_id.clone(),
        }
    }
}

/// Kind of mutation reported by the store's change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Display metadata for a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub lead_name: String,
}

/// One change notification from the score store
///
/// Carries the record's full current state plus its key. For deletes the
/// record holds the removed row and `updated_at` is the deletion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreChange {
    pub kind: ChangeKind,
    pub record: ScoreRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectMeta>,
}

impl ScoreChange {
    pub fn new(kind: ChangeKind, record: ScoreRecord) -> Self {
        Self {
            kind,
            record,
            project: None,
        }
    }

    pub fn with_project(mut self, project: ProjectMeta) -> Self {
        self.project = Some(project);
        self
    }
}

// ========================================
// Track configuration (stored shape)
// ========================================

/// Criterion as stored by the organizer tooling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionDoc {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likert_scale: Option<u32>,
}

/// Scoring config document attached to a track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfigDoc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub criteria: Vec<CriterionDoc>,
}

/// A track as known to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDefinition {
    pub event_id: String,
    pub track_id: String,
    #[serde(default)]
    pub name: String,
    /// `None` when the organizer never configured scoring for the track
    #[serde(default)]
    pub scoring: Option<ScoringConfigDoc>,
}

// ========================================
// Track configuration (normalized)
// ========================================

/// Value domain of a criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CriterionKind {
    Numeric { min: f64, max: f64 },
    #[serde(rename = "multiplechoice")]
    MultipleChoice { options: Vec<String> },
}

/// A raw value mapped into its criterion's domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainValue {
    pub value: f64,
    /// The raw value lay outside the domain and was clamped
    pub clamped: bool,
}

/// One scoring dimension of a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: CriterionKind,
    pub weight: f64,
}

impl Criterion {
    pub fn numeric(id: &str, min: f64, max: f64, weight: f64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind: CriterionKind::Numeric { min, max },
            weight: normalize_weight(Some(weight)),
        }
    }

    pub fn multiple_choice(id: &str, options: &[&str], weight: f64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind: CriterionKind::MultipleChoice {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            weight: normalize_weight(Some(weight)),
        }
    }

    /// Normalize a stored criterion
    ///
    /// `likert`/`scale` become numeric `[1, likertScale]`, `choice` is an
    /// alias of `multiplechoice`. Empty ids, inverted domains, empty option
    /// lists and unknown types are rejected.
    pub fn from_doc(doc: &CriterionDoc) -> Result<Self> {
        if doc.id.trim().is_empty() {
            return Err(Error::InvalidInput("criterion without id".to_string()));
        }

        let kind = match doc.kind.as_deref().unwrap_or("numeric") {
            "numeric" => {
                let min = doc.min.unwrap_or(DEFAULT_NUMERIC_MIN);
                let max = doc.max.unwrap_or(DEFAULT_NUMERIC_MAX);
                if !(min.is_finite() && max.is_finite()) || min > max {
                    return Err(Error::InvalidInput(format!(
                        "criterion {}: invalid domain [{}, {}]",
                        doc.id, min, max
                    )));
                }
                CriterionKind::Numeric { min, max }
            }
            "likert" | "scale" => {
                let points = doc.likert_scale.unwrap_or(DEFAULT_LIKERT_POINTS).max(1);
                CriterionKind::Numeric {
                    min: 1.0,
                    max: points as f64,
                }
            }
            "multiplechoice" | "choice" => {
                let options = doc.options.clone().unwrap_or_default();
                if options.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "criterion {}: multiple choice without options",
                        doc.id
                    )));
                }
                CriterionKind::MultipleChoice { options }
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "criterion {}: unknown type '{}'",
                    doc.id, other
                )))
            }
        };

        Ok(Self {
            id: doc.id.clone(),
            name: if doc.name.is_empty() { doc.id.clone() } else { doc.name.clone() },
            kind,
            weight: normalize_weight(doc.weight),
        })
    }

    /// Inclusive numeric domain of raw values
    pub fn domain(&self) -> (f64, f64) {
        match &self.kind {
            CriterionKind::Numeric { min, max } => (*min, *max),
            CriterionKind::MultipleChoice { options } => {
                (0.0, options.len().saturating_sub(1) as f64)
            }
        }
    }

    /// Map a raw value into this criterion's domain
    ///
    /// Returns `None` for values that cannot be interpreted (non-finite
    /// numbers, unparseable text, unknown option text).
    pub fn to_domain(&self, raw: &RawValue) -> Option<DomainValue> {
        let value = match (&self.kind, raw) {
            (_, RawValue::Number(n)) => *n,
            (CriterionKind::Numeric { .. }, RawValue::Text(text)) => text.trim().parse::<f64>().ok()?,
            (CriterionKind::MultipleChoice { options }, RawValue::Text(text)) => {
                options.iter().position(|o| o == text)? as f64
            }
        };
        if !value.is_finite() {
            return None;
        }

        let (min, max) = self.domain();
        let mut in_domain = value.clamp(min, max);
        if matches!(self.kind, CriterionKind::MultipleChoice { .. }) {
            // ordinal index
            in_domain = in_domain.round();
        }
        Some(DomainValue {
            value: in_domain,
            clamped: in_domain != value,
        })
    }

    pub fn is_multiple_choice(&self) -> bool {
        matches!(self.kind, CriterionKind::MultipleChoice { .. })
    }
}

/// Missing, zero or non-finite weights count as 1, never as "exclude"
fn normalize_weight(weight: Option<f64>) -> f64 {
    match weight {
        Some(w) if w.is_finite() && w != 0.0 => w,
        _ => DEFAULT_WEIGHT,
    }
}

/// Ordered scoring criteria of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub track_id: String,
    pub name: String,
    pub criteria: Vec<Criterion>,
    /// True when built from the default template
    #[serde(default)]
    pub is_default: bool,
}

impl TrackConfig {
    pub fn new(track_id: &str, name: &str, criteria: Vec<Criterion>) -> Self {
        Self {
            track_id: track_id.to_string(),
            name: name.to_string(),
            criteria,
            is_default: false,
        }
    }

    /// Four numeric criteria (technical, innovation, impact, presentation), weight 1
    pub fn default_template(track_id: &str, name: &str) -> Self {
        let criteria = DEFAULT_TEMPLATE
            .iter()
            .map(|(id, label)| Criterion {
                id: id.to_string(),
                name: label.to_string(),
                kind: CriterionKind::Numeric {
                    min: DEFAULT_NUMERIC_MIN,
                    max: DEFAULT_NUMERIC_MAX,
                },
                weight: DEFAULT_WEIGHT,
            })
            .collect();

        Self {
            track_id: track_id.to_string(),
            name: name.to_string(),
            criteria,
            is_default: true,
        }
    }

    /// Build the normalized config for a stored track
    ///
    /// Invalid criteria are dropped with a warning. A track with no scoring
    /// document, or none of whose criteria survive, gets the default template.
    pub fn from_definition(def: &TrackDefinition) -> Self {
        let Some(doc) = &def.scoring else {
            return Self::default_template(&def.track_id, &def.name);
        };

        let mut criteria: Vec<Criterion> = Vec::with_capacity(doc.criteria.len());
        for criterion_doc in &doc.criteria {
            match Criterion::from_doc(criterion_doc) {
                Ok(criterion) if criteria.iter().any(|c| c.id == criterion.id) => {
                    tracing::warn!(
                        track_id = %def.track_id,
                        criterion = %criterion.id,
                        "Duplicate criterion id, keeping the first"
                    );
                }
                Ok(criterion) => criteria.push(criterion),
                Err(e) => {
                    tracing::warn!(track_id = %def.track_id, "Skipping criterion: {}", e);
                }
            }
        }

        if criteria.is_empty() {
            return Self::default_template(&def.track_id, &def.name);
        }

        let name = if def.name.is_empty() { doc.name.clone() } else { def.name.clone() };
        Self::new(&def.track_id, &name, criteria)
    }

    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }
}

// ========================================
// Rankings
// ========================================

/// One row of a track leaderboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    /// 1-based ordinal rank, contiguous even across ties
    pub rank: u32,
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub lead_name: String,
    pub average_score: f64,
    pub total_weighted_score: f64,
    pub judge_count: u32,
}

/// Point-in-time leaderboard of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackLeaderboard {
    pub event_id: String,
    pub track_id: String,
    pub track_name: String,
    pub feed_status: FeedStatus,
    /// Increments whenever the track's ranking changes
    pub version: u64,
    pub entries: Vec<RankedEntry>,
}

impl TrackLeaderboard {
    /// Empty ranking on a live feed: the track has no scores yet
    pub fn has_no_scores_yet(&self) -> bool {
        self.entries.is_empty() && self.feed_status == FeedStatus::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> CriterionDoc {
        CriterionDoc {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_or_zero_weight_counts_as_one() {
        let missing = Criterion::from_doc(&doc("tech")).unwrap();
        assert_eq!(missing.weight, 1.0);

        let zero = Criterion::from_doc(&CriterionDoc {
            weight: Some(0.0),
            ..doc("tech")
        })
        .unwrap();
        assert_eq!(zero.weight, 1.0);

        let three = Criterion::from_doc(&CriterionDoc {
            weight: Some(3.0),
            ..doc("tech")
        })
        .unwrap();
        assert_eq!(three.weight, 3.0);
    }

    #[test]
    fn test_numeric_domain_defaults() {
        let criterion = Criterion::from_doc(&doc("tech")).unwrap();
        assert_eq!(criterion.domain(), (1.0, 10.0));
    }

    #[test]
    fn test_likert_becomes_numeric_scale() {
        let criterion = Criterion::from_doc(&CriterionDoc {
            kind: Some("likert".to_string()),
            likert_scale: Some(7),
            ..doc("ux")
        })
        .unwrap();
        assert_eq!(criterion.kind, CriterionKind::Numeric { min: 1.0, max: 7.0 });
    }

    #[test]
    fn test_invalid_criteria_rejected() {
        let inverted = CriterionDoc {
            min: Some(10.0),
            max: Some(1.0),
            ..doc("tech")
        };
        assert!(Criterion::from_doc(&inverted).is_err());

        let no_options = CriterionDoc {
            kind: Some("multiplechoice".to_string()),
            ..doc("stack")
        };
        assert!(Criterion::from_doc(&no_options).is_err());

        let unknown = CriterionDoc {
            kind: Some("ranking".to_string()),
            ..doc("x")
        };
        assert!(Criterion::from_doc(&unknown).is_err());
    }

    #[test]
    fn test_multiple_choice_accepts_index_or_option_text() {
        let criterion = Criterion::multiple_choice("stack", &["poor", "ok", "good", "great"], 2.0);
        assert_eq!(criterion.domain(), (0.0, 3.0));

        let by_index = criterion.to_domain(&RawValue::Number(2.0)).unwrap();
        assert_eq!(by_index.value, 2.0);

        let by_text = criterion.to_domain(&RawValue::from("great")).unwrap();
        assert_eq!(by_text.value, 3.0);
        assert!(!by_text.clamped);

        assert!(criterion.to_domain(&RawValue::from("unknown")).is_none());
    }

    #[test]
    fn test_numeric_values_are_clamped() {
        let criterion = Criterion::numeric("tech", 1.0, 10.0, 1.0);

        let high = criterion.to_domain(&RawValue::Number(14.0)).unwrap();
        assert_eq!(high.value, 10.0);
        assert!(high.clamped);

        let text = criterion.to_domain(&RawValue::from(" 7.5 ")).unwrap();
        assert_eq!(text.value, 7.5);

        assert!(criterion.to_domain(&RawValue::Number(f64::NAN)).is_none());
        assert!(criterion.to_domain(&RawValue::from("seven")).is_none());
    }

    #[test]
    fn test_missing_scoring_uses_default_template() {
        let def = TrackDefinition {
            event_id: "ev".to_string(),
            track_id: "ai".to_string(),
            name: "AI Track".to_string(),
            scoring: None,
        };
        let config = TrackConfig::from_definition(&def);

        assert!(config.is_default);
        let ids: Vec<&str> = config.criteria.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["technical", "innovation", "impact", "presentation"]);
        assert!(config.criteria.iter().all(|c| c.weight == 1.0));
    }

    #[test]
    fn test_definition_keeps_valid_criteria_only() {
        let def = TrackDefinition {
            event_id: "ev".to_string(),
            track_id: "web".to_string(),
            name: "Web".to_string(),
            scoring: Some(ScoringConfigDoc {
                name: "Web scoring".to_string(),
                criteria: vec![
                    CriterionDoc {
                        weight: Some(2.0),
                        ..doc("tech")
                    },
                    CriterionDoc {
                        kind: Some("bogus".to_string()),
                        ..doc("broken")
                    },
                    doc("tech"),
                ],
            }),
        };
        let config = TrackConfig::from_definition(&def);

        assert!(!config.is_default);
        assert_eq!(config.criteria.len(), 1);
        assert_eq!(config.criterion("tech").unwrap().weight, 2.0);
        assert!(config.criterion("broken").is_none());
    }

    #[test]
    fn test_scoring_doc_parses_stored_json() {
        let json = r#"{
            "name": "Demo Track Scoring",
            "criteria": [
                {"id": "innovation", "name": "Innovation Level", "type": "numeric", "min": 1, "max": 10, "weight": 3},
                {"id": "technology", "name": "Technology Choice", "type": "multiplechoice",
                 "options": ["Poor", "Acceptable", "Good", "Excellent"], "weight": 2},
                {"id": "ux", "name": "UX", "type": "likert", "likertScale": 7}
            ]
        }"#;
        let doc: ScoringConfigDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.criteria.len(), 3);
        assert_eq!(doc.criteria[2].likert_scale, Some(7));
        assert_eq!(doc.criteria[1].options.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_score_record_accepts_mixed_raw_values() {
        let json = r#"{
            "project_id": "p1", "judge_id": "j1", "track_id": "t1", "event_id": "e1",
            "scores": {"tech": 8, "stack": "Good"},
            "updated_at": "2026-03-01T10:00:00Z"
        }"#;
        let record: ScoreRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.scores["tech"], RawValue::Number(8.0));
        assert_eq!(record.scores["stack"], RawValue::Text("Good".to_string()));
        assert!(record.comments.is_none());
    }
}
