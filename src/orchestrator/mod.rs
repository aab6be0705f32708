//! Job Orchestrator
//!
//! Owns the lifecycle of training jobs: selects participants, drives each
//! job's sequential round loop through its framework adapter, aggregates,
//! and decides convergence.
//!
//! ## State machine
//!
//! ```text
//! Pending → Initializing → Running(Collecting) → Running(Aggregating)
//!                               ↑                      │
//!                               └──── next round ──────┤
//!                                                      ↓
//!                                   Completed | Failed | Cancelled
//! ```
//!
//! Terminal states are final; at most one aggregation result is stored per
//! (job, round).

pub mod convergence;
pub mod engine;
pub mod job;
pub mod selection;

pub use convergence::{ConvergenceCriteria, Verdict};
pub use engine::{Orchestrator, OrchestratorBuilder, OrchestratorSettings, RecoveryReport};
pub use job::{FailureReason, JobConfig, JobSnapshot, JobStatus, PrivacyConfig, RoundPhase};
pub use selection::{SelectionPolicy, SelectionStrategy};

use crate::adapter::AdapterError;
use crate::identity::AuthorizationError;
use crate::model::JobId;
use crate::persistence::JournalError;
use crate::privacy::BudgetError;
use crate::registry::RegistryError;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid job config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Unauthorized(#[from] AuthorizationError),

    #[error("insufficient participants: {required} required, {available} available")]
    InsufficientParticipants { required: usize, available: usize },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {job_id} is not accepting updates ({status})")]
    JobNotActive { job_id: JobId, status: JobStatus },

    #[error("no transport hub configured")]
    TransportUnavailable,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Update(#[from] AdapterError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}
