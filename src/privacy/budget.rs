//! Per-job privacy budget accounting.
//!
//! Consumption only ever increases and never exceeds the allotment. All
//! mutations happen under one lock so two concurrent consumers can never
//! both succeed when their combined cost exceeds what remains.

use crate::model::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Tolerance for floating point comparisons against the allotment.
const EPSILON_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("no privacy budget initialized for job {0}")]
    UnknownJob(JobId),

    #[error("invalid epsilon value: {0} (must be > 0)")]
    InvalidEpsilon(f64),

    #[error("invalid consumption amount: {0}")]
    InvalidAmount(f64),
}

/// Outcome of a consumption request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consumption {
    Accepted { remaining: f64 },
    Rejected { requested: f64, remaining: f64 },
}

impl Consumption {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Consumption::Accepted { .. })
    }
}

/// Budget state for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudgetState {
    pub job_id: JobId,
    pub total_epsilon: f64,
    pub consumed_epsilon: f64,
}

impl PrivacyBudgetState {
    pub fn remaining(&self) -> f64 {
        (self.total_epsilon - self.consumed_epsilon).max(0.0)
    }
}

/// Tracks privacy budgets for every job.
#[derive(Debug, Default)]
pub struct PrivacyBudgetTracker {
    budgets: Mutex<HashMap<JobId, PrivacyBudgetState>>,
}

impl PrivacyBudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allot `total_epsilon` to a job. Re-initializing resets consumption.
    pub fn initialize(&self, job_id: JobId, total_epsilon: f64) -> Result<(), BudgetError> {
        if !(total_epsilon > 0.0) || !total_epsilon.is_finite() {
            return Err(BudgetError::InvalidEpsilon(total_epsilon));
        }
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.insert(
            job_id,
            PrivacyBudgetState {
                job_id,
                total_epsilon,
                consumed_epsilon: 0.0,
            },
        );
        Ok(())
    }

    /// Restore a journaled budget after a restart.
    pub fn restore(&self, state: PrivacyBudgetState) {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.insert(state.job_id, state);
    }

    /// Atomically consume `amount` if it fits in the remaining budget.
    pub fn try_consume(&self, job_id: JobId, amount: f64) -> Result<Consumption, BudgetError> {
        if amount < 0.0 || !amount.is_finite() {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        let state = budgets
            .get_mut(&job_id)
            .ok_or(BudgetError::UnknownJob(job_id))?;

        let remaining = state.remaining();
        if amount > remaining + EPSILON_TOLERANCE {
            return Ok(Consumption::Rejected {
                requested: amount,
                remaining,
            });
        }

        state.consumed_epsilon = (state.consumed_epsilon + amount).min(state.total_epsilon);
        Ok(Consumption::Accepted {
            remaining: state.remaining(),
        })
    }

    /// Remaining epsilon for a job.
    pub fn remaining(&self, job_id: JobId) -> Result<f64, BudgetError> {
        self.state(job_id).map(|s| s.remaining())
    }

    /// Snapshot of a job's budget.
    pub fn state(&self, job_id: JobId) -> Result<PrivacyBudgetState, BudgetError> {
        let budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets
            .get(&job_id)
            .cloned()
            .ok_or(BudgetError::UnknownJob(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_consume_until_exhausted() {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        tracker.initialize(job, 1.0).unwrap();

        assert!(tracker.try_consume(job, 0.6).unwrap().is_accepted());
        let second = tracker.try_consume(job, 0.6).unwrap();
        assert!(matches!(second, Consumption::Rejected { .. }));
        assert!((tracker.remaining(job).unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_exact_fit_is_accepted() {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        tracker.initialize(job, 1.0).unwrap();

        for _ in 0..10 {
            assert!(tracker.try_consume(job, 0.1).unwrap().is_accepted());
        }
        assert!(tracker.remaining(job).unwrap() < 1e-9);
        assert!(!tracker.try_consume(job, 0.1).unwrap().is_accepted());
    }

    #[test]
    fn test_unknown_job() {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        assert_eq!(
            tracker.try_consume(job, 0.1).unwrap_err(),
            BudgetError::UnknownJob(job)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tracker = PrivacyBudgetTracker::new();
        let job = JobId::new();
        assert!(tracker.initialize(job, 0.0).is_err());
        assert!(tracker.initialize(job, f64::NAN).is_err());
        tracker.initialize(job, 1.0).unwrap();
        assert!(tracker.try_consume(job, -0.5).is_err());
    }

    #[test]
    fn test_concurrent_consumers_never_overspend() {
        let tracker = Arc::new(PrivacyBudgetTracker::new());
        let job = JobId::new();
        tracker.initialize(job, 1.0).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.try_consume(job, 0.3).unwrap().is_accepted())
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 3);
        let state = tracker.state(job).unwrap();
        assert!(state.consumed_epsilon <= state.total_epsilon);
    }
}
