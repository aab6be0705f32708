//! Persistence collaborator boundary.
//!
//! The engine writes every participant registration, job-status transition,
//! accepted update, aggregation result and budget change through a
//! `JournalStore`, and rebuilds its state from `replay()` after a restart.
//! Writes are pass-through: the engine never reads the journal while running.

use crate::adapter::AdapterKind;
use crate::model::{AggregationResult, JobId, ParticipantId, Round, UpdateRecord};
use crate::orchestrator::{JobConfig, JobStatus};
use crate::privacy::PrivacyBudgetState;
use crate::registry::Participant;
use crate::serialization::SerializationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("journal entry of {0} bytes exceeds limit")]
    EntryTooLarge(usize),
}

/// One durable fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    ParticipantRegistered {
        participant: Participant,
    },
    JobCreated {
        job_id: JobId,
        config: JobConfig,
        participants: Vec<ParticipantId>,
        adapter: AdapterKind,
        created_at: u64,
    },
    Transition {
        job_id: JobId,
        status: JobStatus,
        round: Round,
        at: u64,
    },
    UpdateAccepted {
        record: UpdateRecord,
    },
    RoundAggregated {
        result: AggregationResult,
    },
    Budget {
        state: PrivacyBudgetState,
    },
}

impl JournalEntry {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JournalEntry::ParticipantRegistered { .. } => None,
            JournalEntry::JobCreated { job_id, .. } | JournalEntry::Transition { job_id, .. } => {
                Some(*job_id)
            }
            JournalEntry::UpdateAccepted { record } => Some(record.job_id),
            JournalEntry::RoundAggregated { result } => Some(result.job_id),
            JournalEntry::Budget { state } => Some(state.job_id),
        }
    }
}

/// Append-only journal.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Durably append one entry.
    async fn append(&self, entry: JournalEntry) -> JournalResult<()>;

    /// Every entry in append order.
    async fn replay(&self) -> JournalResult<Vec<JournalEntry>>;

    async fn record_participant(&self, participant: &Participant) -> JournalResult<()> {
        self.append(JournalEntry::ParticipantRegistered {
            participant: participant.clone(),
        })
        .await
    }

    async fn record_transition(
        &self,
        job_id: JobId,
        status: &JobStatus,
        round: Round,
        at: u64,
    ) -> JournalResult<()> {
        self.append(JournalEntry::Transition {
            job_id,
            status: status.clone(),
            round,
            at,
        })
        .await
    }

    async fn record_update(&self, record: &UpdateRecord) -> JournalResult<()> {
        self.append(JournalEntry::UpdateAccepted {
            record: record.clone(),
        })
        .await
    }

    async fn record_result(&self, result: &AggregationResult) -> JournalResult<()> {
        self.append(JournalEntry::RoundAggregated {
            result: result.clone(),
        })
        .await
    }

    async fn record_budget(&self, state: &PrivacyBudgetState) -> JournalResult<()> {
        self.append(JournalEntry::Budget {
            state: state.clone(),
        })
        .await
    }
}
