//! Deterministic convergence metrics.

use super::weighted::{l2_distance, l2_norm};
use crate::model::{ConvergenceMetrics, ResolvedUpdate};

/// The global model state a round started from.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundBaseline {
    pub parameters: Vec<f64>,
    /// Mean training loss reported in the previous round, if any
    pub mean_loss: Option<f64>,
}

impl RoundBaseline {
    pub fn initial(parameters: Vec<f64>) -> Self {
        Self {
            parameters,
            mean_loss: None,
        }
    }
}

/// Sample-weighted mean of the losses reported by `updates`.
pub(crate) fn mean_loss(updates: &[&ResolvedUpdate]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut samples = 0u64;
    for u in updates {
        if let Some(loss) = u.training_loss.filter(|l| l.is_finite()) {
            weighted += loss * u.sample_count as f64;
            samples += u.sample_count;
        }
    }
    (samples > 0).then(|| weighted / samples as f64)
}

/// Compare the new global model against the round baseline.
pub(crate) fn convergence_metrics(
    baseline: &RoundBaseline,
    aggregated: &[f64],
    kept: &[&ResolvedUpdate],
) -> ConvergenceMetrics {
    let distance = if baseline.parameters.len() == aggregated.len() {
        l2_distance(&baseline.parameters, aggregated)
    } else {
        l2_norm(aggregated)
    };
    let current_loss = mean_loss(kept);

    let loss_delta = match (baseline.mean_loss, current_loss) {
        (Some(previous), Some(current)) => previous - current,
        _ => distance / l2_norm(&baseline.parameters).max(1e-12),
    };

    ConvergenceMetrics {
        loss_delta,
        parameter_stability: 1.0 / (1.0 + distance),
        mean_loss: current_loss,
    }
}
