//! Robust Aggregator
//!
//! Combines one round's updates into a single global model:
//!
//! - **Weighted average**: weight = `sample_count / Σ sample_count`
//! - **Fault tolerant**: additionally excludes updates whose deviation from
//!   the coordinate-wise median exceeds `fault_tolerance × median deviation`
//!
//! Aggregation is deterministic and independent of reporting order.

pub mod metrics;
pub mod robust;
pub mod weighted;

#[cfg(test)]
mod proptests;

pub use metrics::RoundBaseline;
pub use robust::{deviation_scores, DeviationScore, MIN_UPDATES_FOR_DETECTION};

use crate::model::{AggregationResult, JobId, ParticipantId, ResolvedUpdate, Round};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default deviation multiple for outlier exclusion.
pub const DEFAULT_FAULT_TOLERANCE: f64 = 3.0;

/// Aggregation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationAlgorithm {
    /// Plain sample-weighted averaging
    WeightedAverage,
    /// Weighted averaging with Byzantine outlier exclusion
    FaultTolerant,
}

/// Per-job aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Explicit algorithm; `None` lets the framework adapter pick its default
    #[serde(default)]
    pub algorithm: Option<AggregationAlgorithm>,
    /// Deviation multiple of the round median above which an update is excluded
    #[serde(default = "default_fault_tolerance")]
    pub fault_tolerance: f64,
    /// Accepted updates needed to aggregate; defaults to the selection minimum
    #[serde(default)]
    pub quorum: Option<usize>,
}

fn default_fault_tolerance() -> f64 {
    DEFAULT_FAULT_TOLERANCE
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            algorithm: None,
            fault_tolerance: DEFAULT_FAULT_TOLERANCE,
            quorum: None,
        }
    }
}

/// Aggregation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("no updates to aggregate")]
    Empty,

    #[error("update from {participant} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        participant: ParticipantId,
        expected: usize,
        got: usize,
    },

    #[error("updates report zero total samples")]
    ZeroSamples,

    #[error("every update was flagged as faulty ({} excluded)", .excluded.len())]
    AllExcluded { excluded: Vec<ParticipantId> },
}

/// Stateless aggregator; one call per (job, round).
#[derive(Debug, Clone, Copy, Default)]
pub struct RobustAggregator;

impl RobustAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate a round.
    ///
    /// Updates with non-finite parameters are always excluded as faulty.
    pub fn aggregate(
        &self,
        job_id: JobId,
        round: Round,
        updates: &[ResolvedUpdate],
        algorithm: AggregationAlgorithm,
        fault_tolerance: f64,
        baseline: &RoundBaseline,
    ) -> Result<AggregationResult, AggregationError> {
        if updates.is_empty() {
            return Err(AggregationError::Empty);
        }

        let mut excluded = Vec::new();
        let finite: Vec<&ResolvedUpdate> = weighted::canonical_order(updates)
            .into_iter()
            .filter(|u| {
                let ok = u.parameters.iter().all(|v| v.is_finite());
                if !ok {
                    excluded.push(u.participant_id.clone());
                }
                ok
            })
            .collect();

        let kept = match algorithm {
            AggregationAlgorithm::WeightedAverage => finite,
            AggregationAlgorithm::FaultTolerant => {
                let partition = robust::partition_outliers(finite, fault_tolerance)?;
                excluded.extend(partition.excluded);
                partition.kept
            }
        };

        if kept.is_empty() {
            excluded.sort();
            return Err(AggregationError::AllExcluded { excluded });
        }

        let aggregated_parameters = weighted::weighted_average(&kept)?;
        let metrics = metrics::convergence_metrics(baseline, &aggregated_parameters, &kept);

        let participating = kept.iter().map(|u| u.participant_id.clone()).collect();
        excluded.sort();

        Ok(AggregationResult {
            job_id,
            round,
            aggregated_parameters,
            participating,
            excluded,
            metrics,
        })
    }
}
