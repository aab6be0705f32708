//! Training job configuration, status and snapshots.

use super::convergence::ConvergenceCriteria;
use super::selection::SelectionPolicy;
use crate::adapter::AdapterKind;
use crate::aggregation::AggregationConfig;
use crate::model::{ConvergenceMetrics, JobId, ParticipantId, Round};
use crate::privacy::PrivacyMechanism;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default privacy budget per job.
pub const DEFAULT_EPSILON: f64 = 10.0;

/// Sub-state of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Collecting,
    Aggregating,
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PrivacyBudgetExhausted,
    InsufficientQuorum,
    AllUpdatesFaulty,
    AdapterFailure,
    AggregationError,
    /// The orchestrator restarted while the job was running
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::PrivacyBudgetExhausted => "privacy_budget_exhausted",
            FailureReason::InsufficientQuorum => "insufficient_quorum",
            FailureReason::AllUpdatesFaulty => "all_updates_faulty",
            FailureReason::AdapterFailure => "adapter_failure",
            FailureReason::AggregationError => "aggregation_error",
            FailureReason::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

/// Job lifecycle.
///
/// `Pending → Initializing → Running(Collecting) ⇄ Running(Aggregating)`,
/// ending in exactly one of `Completed`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Initializing,
    Running { round: Round, phase: RoundPhase },
    Completed { converged: bool },
    Failed { reason: FailureReason },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            JobStatus::Running {
                phase: RoundPhase::Collecting,
                ..
            }
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => f.write_str("pending"),
            JobStatus::Initializing => f.write_str("initializing"),
            JobStatus::Running { round, phase } => {
                let phase = match phase {
                    RoundPhase::Collecting => "collecting",
                    RoundPhase::Aggregating => "aggregating",
                };
                write!(f, "running (round {}, {})", round, phase)
            }
            JobStatus::Completed { converged: true } => f.write_str("completed (converged)"),
            JobStatus::Completed { converged: false } => f.write_str("completed"),
            JobStatus::Failed { reason } => write!(f, "failed ({})", reason),
            JobStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Privacy settings for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub mechanism: PrivacyMechanism,
    /// Reject updates without a valid proof token
    #[serde(default)]
    pub require_proof: bool,
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            mechanism: PrivacyMechanism::default(),
            require_proof: false,
        }
    }
}

/// Everything an operator specifies when starting a job.
///
/// Loadable from TOML:
///
/// ```toml
/// name = "keyboard-next-word"
/// target_rounds = 20
/// initial_parameters = [0.0, 0.0, 0.0]
/// round_timeout = "45s"
///
/// [selection]
/// strategy = "highest_capability"
/// min_participants = 3
///
/// [privacy]
/// epsilon = 4.0
/// mechanism = { mode = "per_round", cost = 0.2 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub target_rounds: u32,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub convergence: ConvergenceCriteria,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    pub initial_parameters: Vec<f64>,
    /// Base round timeout; the orchestrator default applies when absent
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::serialization::duration::option"
    )]
    pub round_timeout: Option<Duration>,
}

impl JobConfig {
    /// Minimal config with default policies.
    pub fn new(target_rounds: u32, initial_parameters: Vec<f64>) -> Self {
        Self {
            name: None,
            target_rounds,
            selection: SelectionPolicy::default(),
            aggregation: AggregationConfig::default(),
            convergence: ConvergenceCriteria::default(),
            privacy: PrivacyConfig::default(),
            initial_parameters,
            round_timeout: None,
        }
    }

    /// Updates required before a round aggregates.
    pub fn quorum(&self) -> usize {
        self.aggregation
            .quorum
            .unwrap_or(self.selection.min_participants)
    }

    /// Check the config before anything is allocated for it.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_rounds == 0 {
            return Err("target_rounds must be greater than 0".into());
        }
        if self.selection.min_participants < 2 {
            return Err("min_participants must be at least 2".into());
        }
        if self.selection.max_participants < self.selection.min_participants {
            return Err(format!(
                "max_participants ({}) is below min_participants ({})",
                self.selection.max_participants, self.selection.min_participants
            ));
        }
        let quorum = self.quorum();
        if quorum == 0 || quorum > self.selection.max_participants {
            return Err(format!(
                "quorum {} must be within 1..={}",
                quorum, self.selection.max_participants
            ));
        }
        if !(self.privacy.epsilon > 0.0) || !self.privacy.epsilon.is_finite() {
            return Err(format!("epsilon must be positive, got {}", self.privacy.epsilon));
        }
        let cost = self.privacy.mechanism.cost();
        if cost < 0.0 || !cost.is_finite() {
            return Err(format!("privacy cost must be non-negative, got {}", cost));
        }
        if !(self.aggregation.fault_tolerance > 1.0) {
            return Err(format!(
                "fault_tolerance must be greater than 1.0, got {}",
                self.aggregation.fault_tolerance
            ));
        }
        if self.initial_parameters.is_empty() {
            return Err("initial_parameters must not be empty".into());
        }
        if self.initial_parameters.iter().any(|v| !v.is_finite()) {
            return Err("initial_parameters must be finite".into());
        }
        if self.convergence.max_rounds == 0 {
            return Err("convergence.max_rounds must be greater than 0".into());
        }
        if self.round_timeout == Some(Duration::ZERO) {
            return Err("round_timeout must be non-zero".into());
        }
        Ok(())
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub name: Option<String>,
    pub status: JobStatus,
    pub adapter: AdapterKind,
    pub participants: Vec<ParticipantId>,
    pub current_round: Round,
    pub rounds_completed: u32,
    pub target_rounds: u32,
    pub remaining_epsilon: f64,
    pub latest_metrics: Option<ConvergenceMetrics>,
}
