//! Core data model shared by every layer of the engine.
//!
//! Identifiers, the per-round update payloads exchanged with participants,
//! and the immutable records produced by aggregation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Round number within a job (1-based).
pub type Round = u32;

/// Training job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Participant identifier, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Top-k sparsified delta against the round's global model.
///
/// Only the largest-magnitude coordinates travel; the rest are implied zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseDelta {
    /// Coordinates that were kept
    pub indices: Vec<u32>,
    /// Delta values at those coordinates
    pub values: Vec<f64>,
    /// Dimension of the dense vector
    pub dimension: usize,
}

impl SparseDelta {
    /// Expand into a dense delta vector.
    pub fn to_dense(&self) -> Vec<f64> {
        let mut dense = vec![0.0; self.dimension];
        for (&idx, &val) in self.indices.iter().zip(self.values.iter()) {
            if let Some(slot) = dense.get_mut(idx as usize) {
                *slot = val;
            }
        }
        dense
    }

    /// Number of transmitted coordinates.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Fraction of coordinates that were dropped (0.0 - 1.0).
    pub fn reduction(&self) -> f64 {
        if self.dimension == 0 {
            return 0.0;
        }
        1.0 - self.nnz() as f64 / self.dimension as f64
    }
}

/// Parameter payload as reported by a participant.
///
/// The orchestrator treats this as opaque; the framework adapter that owns
/// the round knows how to materialize it into a dense parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Full parameter vector
    Dense(Vec<f64>),
    /// Sparse delta relative to the round's global model
    SparseDelta(SparseDelta),
    /// LZ4-compressed CBOR encoding of the full parameter vector
    Compressed(Vec<u8>),
}

/// A participant's contribution for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub job_id: JobId,
    pub participant_id: ParticipantId,
    pub round: Round,
    pub payload: UpdatePayload,
    /// Samples used for local training (aggregation weight)
    pub sample_count: u64,
    /// Local training loss, when the participant reports one
    #[serde(default)]
    pub training_loss: Option<f64>,
    /// Opaque token checked by the job's privacy guard
    #[serde(default)]
    pub privacy_proof: Option<String>,
}

/// An update whose payload has been materialized by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUpdate {
    pub participant_id: ParticipantId,
    pub parameters: Vec<f64>,
    pub sample_count: u64,
    pub training_loss: Option<f64>,
}

/// Convergence signals computed after each aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceMetrics {
    /// Improvement since the previous round (positive = better)
    pub loss_delta: f64,
    /// 1 / (1 + L2 distance to the previous global model)
    pub parameter_stability: f64,
    /// Sample-weighted mean of reported training losses
    pub mean_loss: Option<f64>,
}

/// Outcome of aggregating one round. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub job_id: JobId,
    pub round: Round,
    pub aggregated_parameters: Vec<f64>,
    /// Participants whose updates were averaged (sorted)
    pub participating: Vec<ParticipantId>,
    /// Participants whose updates were flagged as faulty (sorted)
    pub excluded: Vec<ParticipantId>,
    pub metrics: ConvergenceMetrics,
}

/// How an update's payload is kept in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordedPayload {
    /// Materialized parameters, visible to the orchestrator
    Raw(Vec<f64>),
    /// SHA-256 commitment only; the raw vector never leaves the round
    Sealed { digest: String },
}

/// Immutable audit record of an accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub job_id: JobId,
    pub participant_id: ParticipantId,
    pub round: Round,
    pub sample_count: u64,
    pub payload: RecordedPayload,
    pub accepted_at: u64,
}

/// Seconds since the UNIX epoch (0 if the clock is before it).
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
