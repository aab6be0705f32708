//! Convergence decision after each aggregated round.

use crate::model::ConvergenceMetrics;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOSS_THRESHOLD: f64 = 1e-4;
pub const DEFAULT_MAX_ROUNDS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCriteria {
    /// Converged once |loss improvement| drops below this
    #[serde(default = "default_threshold")]
    pub loss_threshold: f64,
    /// Hard cap on rounds regardless of `target_rounds`
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_threshold() -> f64 {
    DEFAULT_LOSS_THRESHOLD
}

fn default_max_rounds() -> u32 {
    DEFAULT_MAX_ROUNDS
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Converged,
    TargetReached,
}

impl ConvergenceCriteria {
    /// Rounds the job may run at most.
    pub fn round_cap(&self, target_rounds: u32) -> u32 {
        target_rounds.min(self.max_rounds)
    }

    /// Decide after `completed_rounds` rounds, the latest producing `metrics`.
    ///
    /// The first round never converges: there is nothing to compare against.
    pub fn evaluate(
        &self,
        completed_rounds: u32,
        target_rounds: u32,
        metrics: &ConvergenceMetrics,
    ) -> Verdict {
        if completed_rounds >= 2 && metrics.loss_delta.abs() < self.loss_threshold {
            Verdict::Converged
        } else if completed_rounds >= self.round_cap(target_rounds) {
            Verdict::TargetReached
        } else {
            Verdict::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss_delta: f64) -> ConvergenceMetrics {
        ConvergenceMetrics {
            loss_delta,
            parameter_stability: 1.0,
            mean_loss: None,
        }
    }

    #[test]
    fn test_first_round_never_converges() {
        let criteria = ConvergenceCriteria::default();
        assert_eq!(criteria.evaluate(1, 10, &metrics(0.0)), Verdict::Continue);
    }

    #[test]
    fn test_small_improvement_converges() {
        let criteria = ConvergenceCriteria::default();
        assert_eq!(criteria.evaluate(2, 10, &metrics(5e-5)), Verdict::Converged);
        assert_eq!(criteria.evaluate(2, 10, &metrics(-5e-5)), Verdict::Converged);
        assert_eq!(criteria.evaluate(2, 10, &metrics(0.5)), Verdict::Continue);
    }

    #[test]
    fn test_target_reached() {
        let criteria = ConvergenceCriteria::default();
        assert_eq!(criteria.evaluate(3, 3, &metrics(0.5)), Verdict::TargetReached);
    }

    #[test]
    fn test_max_rounds_caps_target() {
        let criteria = ConvergenceCriteria {
            loss_threshold: 1e-4,
            max_rounds: 2,
        };
        assert_eq!(criteria.round_cap(50), 2);
        assert_eq!(criteria.evaluate(2, 50, &metrics(1.0)), Verdict::TargetReached);
    }
}
