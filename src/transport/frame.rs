//! Messages exchanged between the orchestrator and participants.

use crate::model::{JobId, ModelUpdate, Round, UpdatePayload};
use crate::registry::Participant;
use crate::serialization::{from_cbor, to_cbor, SerializationError};
use serde::{Deserialize, Serialize};

use super::codec::CompressionCodec;

/// Per-participant training assignment for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingTask {
    pub job_id: JobId,
    pub round: Round,
    /// Global model the participant trains from
    pub global_model: UpdatePayload,
    /// How the participant must encode its update
    pub codec: CompressionCodec,
    /// Seconds the participant has before the round may close without it
    pub deadline_secs: u64,
}

/// Application frame carried inside a `SecureChannel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Participant announces itself (first frame after the handshake)
    Hello(Participant),
    /// Orchestrator assigns a round
    Task(TrainingTask),
    /// Participant reports its local update
    Update(ModelUpdate),
    /// Liveness ping, either direction
    Heartbeat { sent_at: u64 },
    /// Orchestrator abandons a job; outstanding work should be dropped
    Cancel { job_id: JobId },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Task(_) => "task",
            Frame::Update(_) => "update",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::Cancel { .. } => "cancel",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        from_cbor(bytes)
    }
}

/// Plaintext handshake naming the participant, so the accepting side can
/// derive the channel key before any sealed frame arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u16,
    pub participant_id: String,
}

/// Current handshake version.
pub const HANDSHAKE_VERSION: u16 = 1;
