//! Framework Adapters
//!
//! Both adapters run the same round protocol (`round`) and differ only in
//! their profile:
//!
//! | | device | organization |
//! |---|---|---|
//! | uplink encoding | top-k sparse delta (≥ 90% smaller) | LZ4 over CBOR (exact) |
//! | round timeout | 2 × base | 1 × base |
//! | default algorithm | fault tolerant | weighted average |
//! | audit record | raw parameters | SHA-256 commitment only |
//!
//! `select_adapter` picks one from the composition of the selected pool.

pub mod device;
pub mod organization;
pub mod round;

pub use device::DeviceAdapter;
pub use organization::OrganizationAdapter;
pub use round::{Harvest, RoundBook, RoundCollector, RoundSpec, Trigger, UpdateCharge};

use crate::aggregation::AggregationAlgorithm;
use crate::events::ThreatKind;
use crate::model::{JobId, ModelUpdate, ParticipantId, ResolvedUpdate, Round, UpdateRecord};
use crate::privacy::{BudgetError, PrivacyViolation};
use crate::registry::{Participant, ParticipantClass};
use crate::transport::{CompressionCodec, TrainingTask};
use round::Offer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Device,
    Organization,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Device => f.write_str("device"),
            AdapterKind::Organization => f.write_str("organization"),
        }
    }
}

/// Defaults that distinguish one adapter from the other.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterProfile {
    pub kind: AdapterKind,
    pub codec: CompressionCodec,
    pub timeout_multiplier: u32,
    pub default_algorithm: AggregationAlgorithm,
    /// Audit records carry a commitment instead of raw parameters
    pub sealed_records: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("no round is open for job {0}")]
    NoActiveRound(JobId),

    #[error("participant {0} was not selected for this job")]
    NotSelected(ParticipantId),

    #[error("update from {participant} is for round {got}, but round {current} is open")]
    StaleRound {
        participant: ParticipantId,
        got: Round,
        current: Round,
    },

    #[error("update from {participant} is for future round {got}, round {current} is open")]
    FutureRound {
        participant: ParticipantId,
        got: Round,
        current: Round,
    },

    #[error("duplicate update from {participant} for round {round}")]
    Duplicate {
        participant: ParticipantId,
        round: Round,
    },

    #[error("privacy check failed for {participant}: {violation}")]
    Privacy {
        participant: ParticipantId,
        violation: PrivacyViolation,
    },

    #[error("malformed update from {participant}: {reason}")]
    Malformed {
        participant: ParticipantId,
        reason: String,
    },

    #[error("privacy budget exhausted")]
    BudgetExhausted,

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("failed to encode global model: {0}")]
    Encoding(String),

    #[error("dispatch failed for {failed} of {total} participants")]
    DispatchFailed { failed: usize, total: usize },
}

impl AdapterError {
    /// The threat this rejection represents, if it is a security error.
    pub fn threat(&self) -> Option<(ParticipantId, ThreatKind)> {
        match self {
            AdapterError::Privacy {
                participant,
                violation,
            } => Some((
                participant.clone(),
                ThreatKind::PrivacyViolation {
                    detail: violation.to_string(),
                },
            )),
            AdapterError::Malformed {
                participant,
                reason,
            } => Some((
                participant.clone(),
                ThreatKind::MalformedUpdate {
                    detail: reason.clone(),
                },
            )),
            _ => None,
        }
    }
}

/// Tasks for one round plus the window that will collect their results.
pub struct RoundDispatch {
    pub collector: Arc<RoundCollector>,
    pub task: TrainingTask,
    /// Selected participants that still owe an update this round
    pub recipients: Vec<ParticipantId>,
    pub timeout: Duration,
}

/// What happened to a submitted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted { accepted: usize, quorum_reached: bool },
    Deferred { to_round: Round },
}

/// Receipt for a submitted update.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub participant: ParticipantId,
    pub round: Round,
    pub disposition: Disposition,
    pub record: UpdateRecord,
}

/// Shared round protocol; implementors supply a profile and audit policy.
pub trait FrameworkAdapter: Send + Sync {
    fn profile(&self) -> &AdapterProfile;

    fn rounds(&self) -> &RoundBook;

    /// Audit record for an accepted update.
    fn audit_record(&self, job_id: JobId, round: Round, update: &ResolvedUpdate) -> UpdateRecord;

    fn kind(&self) -> AdapterKind {
        self.profile().kind
    }

    fn default_algorithm(&self) -> AggregationAlgorithm {
        self.profile().default_algorithm
    }

    /// Open a round and build the per-participant tasks.
    fn start_round(&self, spec: RoundSpec) -> Result<RoundDispatch, AdapterError> {
        let profile = self.profile();
        let timeout = spec.base_timeout * profile.timeout_multiplier.max(1);
        let global_model = profile
            .codec
            .encode_model(&spec.global_model)
            .map_err(|e| AdapterError::Encoding(e.to_string()))?;
        let task = TrainingTask {
            job_id: spec.job_id,
            round: spec.round,
            global_model,
            codec: profile.codec,
            deadline_secs: timeout.as_secs(),
        };

        let participants = spec.participants.clone();
        let collector = self.rounds().open_round(spec);
        let recipients = participants
            .into_iter()
            .filter(|p| !collector.has_update(p))
            .collect();

        Ok(RoundDispatch {
            collector,
            task,
            recipients,
            timeout,
        })
    }

    /// Hand an update to the job's open round.
    fn collect_update(&self, update: &ModelUpdate) -> Result<Admission, AdapterError> {
        let (open_round, offer) = self.rounds().collect(update)?;
        let (resolved, disposition) = match offer {
            Offer::Accepted {
                resolved,
                accepted,
                quorum_reached,
            } => (
                resolved,
                Disposition::Accepted {
                    accepted,
                    quorum_reached,
                },
            ),
            Offer::Deferred { resolved } => (
                resolved,
                Disposition::Deferred {
                    to_round: open_round + 1,
                },
            ),
        };
        Ok(Admission {
            participant: resolved.participant_id.clone(),
            round: update.round,
            record: self.audit_record(update.job_id, update.round, &resolved),
            disposition,
        })
    }

    /// Abandon the job's open round. Returns whether one was open.
    fn stop_job(&self, job_id: &JobId) -> bool {
        self.rounds().close_job(job_id).is_some()
    }
}

/// Majority-device pool → device adapter, otherwise organization.
pub fn select_adapter(pool: &[Participant]) -> AdapterKind {
    let devices = pool
        .iter()
        .filter(|p| p.class == ParticipantClass::Device)
        .count();
    if devices * 2 > pool.len() {
        AdapterKind::Device
    } else {
        AdapterKind::Organization
    }
}
