//! Sample-weighted averaging.
//!
//! Each update contributes with weight `n_i / Σ n`. Inputs are summed in
//! participant-id order so the result is bit-identical regardless of the
//! order in which participants reported.

use super::AggregationError;
use crate::model::ResolvedUpdate;

/// Sort a borrowed update set into canonical (participant id) order.
pub(crate) fn canonical_order<'a>(updates: &'a [ResolvedUpdate]) -> Vec<&'a ResolvedUpdate> {
    let mut ordered: Vec<&ResolvedUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| {
        a.participant_id
            .cmp(&b.participant_id)
            .then(a.sample_count.cmp(&b.sample_count))
    });
    ordered
}

/// Weighted mean of `updates` (already in canonical order).
pub(crate) fn weighted_average(updates: &[&ResolvedUpdate]) -> Result<Vec<f64>, AggregationError> {
    let first = updates.first().ok_or(AggregationError::Empty)?;
    let dim = first.parameters.len();

    for u in updates {
        if u.parameters.len() != dim {
            return Err(AggregationError::DimensionMismatch {
                participant: u.participant_id.clone(),
                expected: dim,
                got: u.parameters.len(),
            });
        }
    }

    let total: u64 = updates.iter().map(|u| u.sample_count).sum();
    if total == 0 {
        return Err(AggregationError::ZeroSamples);
    }

    let mut acc = vec![0.0f64; dim];
    for u in updates {
        let n = u.sample_count as f64;
        for (slot, value) in acc.iter_mut().zip(u.parameters.iter()) {
            *slot += n * value;
        }
    }

    let total = total as f64;
    for slot in acc.iter_mut() {
        *slot /= total;
    }
    Ok(acc)
}

/// Euclidean distance between two equally sized vectors.
pub(crate) fn l2_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

pub(crate) fn l2_norm(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}
