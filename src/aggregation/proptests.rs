//! Property-based tests for aggregation.
//!
//! - Weighted average equals Σ w_i x_i for weights summing to 1
//! - Results do not depend on reporting order
//! - One injected outlier among two or more consistent updates is excluded exactly

use super::{AggregationAlgorithm, RobustAggregator, RoundBaseline, DEFAULT_FAULT_TOLERANCE};
use crate::model::{JobId, ParticipantId, ResolvedUpdate};
use proptest::prelude::*;

fn scalar_update(index: usize, value: f64, samples: u64) -> ResolvedUpdate {
    ResolvedUpdate {
        participant_id: ParticipantId::new(format!("p{:03}", index)),
        parameters: vec![value],
        sample_count: samples,
        training_loss: None,
    }
}

fn aggregate(updates: &[ResolvedUpdate], algorithm: AggregationAlgorithm) -> Vec<f64> {
    RobustAggregator::new()
        .aggregate(
            JobId::new(),
            1,
            updates,
            algorithm,
            DEFAULT_FAULT_TOLERANCE,
            &RoundBaseline::initial(vec![0.0]),
        )
        .unwrap()
        .aggregated_parameters
}

proptest! {
    /// Property: aggregated value equals the explicit weighted sum
    #[test]
    fn weighted_average_matches_weighted_sum(
        inputs in prop::collection::vec((-1000.0f64..1000.0, 1u64..10_000), 1..30),
    ) {
        let updates: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(i, (v, n))| scalar_update(i, *v, *n))
            .collect();

        let total: u64 = inputs.iter().map(|(_, n)| *n).sum();
        let expected: f64 = inputs
            .iter()
            .map(|(v, n)| (*n as f64 / total as f64) * v)
            .sum();

        let result = aggregate(&updates, AggregationAlgorithm::WeightedAverage);
        prop_assert!((result[0] - expected).abs() < 1e-6 * (1.0 + expected.abs()));
    }

    /// Property: shuffling the reporting order never changes the result
    #[test]
    fn aggregation_is_order_independent(
        inputs in prop::collection::vec((-10.0f64..10.0, 1u64..100), 2..20),
        rotation in 0usize..20,
    ) {
        let updates: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(i, (v, n))| scalar_update(i, *v, *n))
            .collect();
        let mut rotated = updates.clone();
        rotated.rotate_left(rotation % updates.len());
        rotated.reverse();

        for algorithm in [AggregationAlgorithm::WeightedAverage, AggregationAlgorithm::FaultTolerant] {
            prop_assert_eq!(aggregate(&updates, algorithm), aggregate(&rotated, algorithm));
        }
    }

    /// Property: a single outlier among N >= 2 consistent updates is excluded
    #[test]
    fn single_outlier_is_excluded(
        consistent in 2usize..12,
        value in -5.0f64..5.0,
        offset in 50.0f64..500.0,
        samples in 1u64..100,
        outlier_slot in 0usize..12,
    ) {
        let mut updates: Vec<_> = (0..consistent)
            .map(|i| scalar_update(i, value, samples))
            .collect();
        let outlier = scalar_update(100 + outlier_slot, value + offset, samples);
        let outlier_id = outlier.participant_id.clone();
        updates.insert(outlier_slot % (consistent + 1), outlier);

        let result = RobustAggregator::new()
            .aggregate(
                JobId::new(),
                1,
                &updates,
                AggregationAlgorithm::FaultTolerant,
                DEFAULT_FAULT_TOLERANCE,
                &RoundBaseline::initial(vec![0.0]),
            )
            .unwrap();

        prop_assert_eq!(result.excluded, vec![outlier_id]);
        prop_assert_eq!(result.participating.len(), consistent);
        prop_assert!((result.aggregated_parameters[0] - value).abs() < 1e-9);
    }
}
