//! Property-based tests for privacy budget accounting.

use super::budget::PrivacyBudgetTracker;
use crate::model::JobId;
use proptest::prelude::*;

proptest! {
    /// Property: remaining budget is non-increasing and never negative
    #[test]
    fn remaining_is_monotonic_and_non_negative(
        total in 0.01f64..10.0,
        requests in prop::collection::vec(0.0f64..2.0, 1..50),
    ) {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        tracker.initialize(job, total).unwrap();

        let mut previous = tracker.remaining(job).unwrap();
        for amount in requests {
            let _ = tracker.try_consume(job, amount).unwrap();
            let remaining = tracker.remaining(job).unwrap();
            prop_assert!(remaining >= 0.0, "remaining went negative: {}", remaining);
            prop_assert!(remaining <= previous + 1e-12, "remaining increased");
            previous = remaining;
        }
    }

    /// Property: accepted consumption never exceeds the allotment
    #[test]
    fn accepted_total_bounded_by_allotment(
        total in 0.01f64..5.0,
        requests in prop::collection::vec(0.0f64..1.0, 1..50),
    ) {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        tracker.initialize(job, total).unwrap();

        let accepted: f64 = requests
            .iter()
            .filter(|amount| tracker.try_consume(job, **amount).unwrap().is_accepted())
            .sum();

        prop_assert!(accepted <= total + 1e-9);
        let state = tracker.state(job).unwrap();
        prop_assert!(state.consumed_epsilon <= state.total_epsilon);
    }
}
