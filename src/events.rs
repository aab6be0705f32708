//! Lifecycle events for the observability collaborator.
//!
//! The orchestrator is handed an `EventSink` at construction and emits typed
//! events through it; there is no global listener registry.

use crate::adapter::AdapterKind;
use crate::model::{ConvergenceMetrics, JobId, ParticipantId, Round};
use crate::orchestrator::FailureReason;
use crate::registry::ParticipantClass;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Why an update was treated as a security threat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreatKind {
    /// Flagged by the fault-tolerant aggregator
    FaultyUpdate,
    /// Privacy proof missing or invalid
    PrivacyViolation { detail: String },
    /// Payload could not be materialized
    MalformedUpdate { detail: String },
    /// Update claims a participant other than the channel it arrived on
    Impersonation { claimed: ParticipantId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ClientRegistered {
        participant: ParticipantId,
        class: ParticipantClass,
    },
    TrainingStarted {
        job_id: JobId,
        participants: Vec<ParticipantId>,
        adapter: AdapterKind,
    },
    RoundCompleted {
        job_id: JobId,
        round: Round,
        participating: usize,
        excluded: Vec<ParticipantId>,
        metrics: ConvergenceMetrics,
    },
    TrainingCompleted {
        job_id: JobId,
        rounds_completed: u32,
        converged: bool,
    },
    SecurityThreatDetected {
        job_id: Option<JobId>,
        round: Option<Round>,
        participant: ParticipantId,
        threat: ThreatKind,
    },
    TrainingFailed {
        job_id: JobId,
        reason: FailureReason,
        rounds_completed: u32,
    },
    TrainingCancelled {
        job_id: JobId,
        round: Round,
    },
    ParticipantOffline {
        participant: ParticipantId,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::ClientRegistered { .. } => "client_registered",
            LifecycleEvent::TrainingStarted { .. } => "training_started",
            LifecycleEvent::RoundCompleted { .. } => "round_completed",
            LifecycleEvent::TrainingCompleted { .. } => "training_completed",
            LifecycleEvent::SecurityThreatDetected { .. } => "security_threat_detected",
            LifecycleEvent::TrainingFailed { .. } => "training_failed",
            LifecycleEvent::TrainingCancelled { .. } => "training_cancelled",
            LifecycleEvent::ParticipantOffline { .. } => "participant_offline",
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            LifecycleEvent::TrainingStarted { job_id, .. }
            | LifecycleEvent::RoundCompleted { job_id, .. }
            | LifecycleEvent::TrainingCompleted { job_id, .. }
            | LifecycleEvent::TrainingFailed { job_id, .. }
            | LifecycleEvent::TrainingCancelled { job_id, .. } => Some(*job_id),
            LifecycleEvent::SecurityThreatDetected { job_id, .. } => *job_id,
            LifecycleEvent::ClientRegistered { .. } | LifecycleEvent::ParticipantOffline { .. } => None,
        }
    }
}

/// Receives lifecycle events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Forwards events into a tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        // A dropped consumer is not the engine's problem
        let _ = self.tx.send(event);
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::SecurityThreatDetected {
                participant,
                threat,
                ..
            } => warn!(event = event.name(), participant = %participant, threat = ?threat, "security threat"),
            LifecycleEvent::TrainingFailed { job_id, reason, .. } => {
                warn!(event = event.name(), job = %job_id, reason = %reason, "training failed")
            }
            other => info!(event = other.name(), job = ?other.job_id(), "{:?}", other),
        }
    }
}

/// Delivers each event to several sinks in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
