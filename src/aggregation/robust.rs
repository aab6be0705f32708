//! Byzantine-tolerant outlier detection.
//!
//! Scores every update by its L2 deviation from the round's robust centroid
//! (the coordinate-wise median of all updates) and flags updates whose
//! deviation exceeds `multiple × median deviation`. Flagged updates are
//! reported, never silently dropped.

use super::weighted::l2_distance;
use super::AggregationError;
use crate::model::{ParticipantId, ResolvedUpdate};

/// Fewer updates than this give no meaningful median.
pub const MIN_UPDATES_FOR_DETECTION: usize = 3;

/// Below this the median deviation is treated as zero.
const DEGENERATE_MEDIAN: f64 = 1e-12;

/// Deviation of a single update from the round centroid.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviationScore {
    pub participant_id: ParticipantId,
    pub deviation: f64,
}

/// Split of a round's updates into kept and flagged sets.
#[derive(Debug)]
pub(crate) struct Partition<'a> {
    pub kept: Vec<&'a ResolvedUpdate>,
    pub excluded: Vec<ParticipantId>,
}

/// Median of a non-empty slice (mean of the two middle values when even).
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Coordinate-wise median of equally sized updates.
pub(crate) fn coordinate_median(updates: &[&ResolvedUpdate]) -> Result<Vec<f64>, AggregationError> {
    let first = updates.first().ok_or(AggregationError::Empty)?;
    let dim = first.parameters.len();
    if let Some(u) = updates.iter().find(|u| u.parameters.len() != dim) {
        return Err(AggregationError::DimensionMismatch {
            participant: u.participant_id.clone(),
            expected: dim,
            got: u.parameters.len(),
        });
    }

    let mut column = Vec::with_capacity(updates.len());
    Ok((0..dim)
        .map(|i| {
            column.clear();
            column.extend(updates.iter().map(|u| u.parameters[i]));
            median(&column)
        })
        .collect())
}

/// Deviation of each update from the coordinate-wise median.
pub fn deviation_scores(
    updates: &[&ResolvedUpdate],
) -> Result<Vec<DeviationScore>, AggregationError> {
    let centroid = coordinate_median(updates)?;
    Ok(updates
        .iter()
        .map(|u| DeviationScore {
            participant_id: u.participant_id.clone(),
            deviation: l2_distance(&u.parameters, &centroid),
        })
        .collect())
}

/// Flag outliers among `updates` (canonical order, finite values).
pub(crate) fn partition_outliers<'a>(
    updates: Vec<&'a ResolvedUpdate>,
    multiple: f64,
) -> Result<Partition<'a>, AggregationError> {
    if updates.len() < MIN_UPDATES_FOR_DETECTION {
        return Ok(Partition {
            kept: updates,
            excluded: Vec::new(),
        });
    }

    let scores = deviation_scores(&updates)?;
    let deviations: Vec<f64> = scores.iter().map(|s| s.deviation).collect();
    let median_deviation = median(&deviations);
    let cutoff = if median_deviation < DEGENERATE_MEDIAN {
        DEGENERATE_MEDIAN * 1e3
    } else {
        multiple * median_deviation
    };

    let mut kept = Vec::with_capacity(updates.len());
    let mut excluded = Vec::new();
    for (update, score) in updates.into_iter().zip(scores.iter()) {
        if score.deviation > cutoff {
            excluded.push(update.participant_id.clone());
        } else {
            kept.push(update);
        }
    }

    Ok(Partition { kept, excluded })
}
