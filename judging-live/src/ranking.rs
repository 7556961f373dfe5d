//! Leaderboard ordering
//!
//! Pure functions over a track's project aggregates. Ordering is total and
//! deterministic: equal averages are broken by `judge_count` (more reviews
//! first), then by `project_id` ascending.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::aggregate::{ProjectAggregate, TrackAggregate};
use judging_common::{CriterionKind, RankedEntry};

/// Order projects into 1-based, contiguous ranks
///
/// Projects with `judge_count == 0` are not ranked.
pub fn rank<'a, I>(projects: I) -> Vec<RankedEntry>
where
    I: IntoIterator<Item = &'a ProjectAggregate>,
{
    let mut entries: Vec<RankedEntry> = projects
        .into_iter()
        .filter_map(|project| {
            let average_score = project.average_score()?;
            Some(RankedEntry {
                rank: 0,
                project_id: project.project_id.clone(),
                project_name: project.project_name.clone(),
                lead_name: project.lead_name.clone(),
                average_score,
                total_weighted_score: project.total_weighted_score(),
                judge_count: project.judge_count(),
            })
        })
        .collect();

    entries.sort_by(compare_entries);
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i as u32 + 1;
    }
    entries
}

/// Leaderboard order: average desc, judge_count desc, project_id asc
pub fn compare_entries(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.average_score
        .total_cmp(&a.average_score)
        .then_with(|| b.judge_count.cmp(&a.judge_count))
        .then_with(|| a.project_id.cmp(&b.project_id))
}

/// Per-criterion view of one ranked project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectBreakdown {
    pub rank: u32,
    pub project_id: String,
    pub project_name: String,
    pub average_score: f64,
    pub judge_count: u32,
    pub criteria: Vec<CriterionBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionBreakdown {
    pub criterion_id: String,
    pub name: String,
    pub weight: f64,
    /// Mean in-domain value over the judges who scored it (numeric only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    /// Selections per option text (multiple choice only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice_counts: Option<BTreeMap<String, u32>>,
}

/// Breakdown of every ranked project, in rank order
pub fn breakdown(track: &TrackAggregate) -> Vec<ProjectBreakdown> {
    let config = track.config();

    rank(track.projects())
        .into_iter()
        .filter_map(|entry| {
            let project = track.project(&entry.project_id)?;
            let averages = project.criterion_averages();

            let criteria = config
                .criteria
                .iter()
                .map(|criterion| {
                    let (average, choice_counts) = match &criterion.kind {
                        CriterionKind::Numeric { .. } => (averages.get(&criterion.id).copied(), None),
                        CriterionKind::MultipleChoice { options } => {
                            let counts = project
                                .choice_counts()
                                .get(&criterion.id)
                                .map(|by_index| {
                                    by_index
                                        .iter()
                                        .filter_map(|(index, count)| {
                                            options.get(*index).map(|o| (o.clone(), *count))
                                        })
                                        .collect()
                                })
                                .unwrap_or_default();
                            (None, Some(counts))
                        }
                    };
                    CriterionBreakdown {
                        criterion_id: criterion.id.clone(),
                        name: criterion.name.clone(),
                        weight: criterion.weight,
                        average,
                        choice_counts,
                    }
                })
                .collect();

            Some(ProjectBreakdown {
                rank: entry.rank,
                project_id: entry.project_id,
                project_name: entry.project_name,
                average_score: entry.average_score,
                judge_count: entry.judge_count,
                criteria,
            })
        })
        .collect()
}
