//! Device-scale adapter: many small, churn-prone participants.

use super::{AdapterKind, AdapterProfile, FrameworkAdapter, RoundBook};
use crate::aggregation::AggregationAlgorithm;
use crate::model::{unix_now, JobId, RecordedPayload, ResolvedUpdate, Round, UpdateRecord};
use crate::transport::CompressionCodec;

pub struct DeviceAdapter {
    profile: AdapterProfile,
    rounds: RoundBook,
}

impl DeviceAdapter {
    pub fn new() -> Self {
        Self::with_codec(CompressionCodec::top_k())
    }

    /// Override the uplink codec (e.g. a different top-k ratio).
    pub fn with_codec(codec: CompressionCodec) -> Self {
        Self {
            profile: AdapterProfile {
                kind: AdapterKind::Device,
                codec,
                timeout_multiplier: 2,
                default_algorithm: AggregationAlgorithm::FaultTolerant,
                sealed_records: false,
            },
            rounds: RoundBook::new(),
        }
    }
}

impl Default for DeviceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkAdapter for DeviceAdapter {
    fn profile(&self) -> &AdapterProfile {
        &self.profile
    }

    fn rounds(&self) -> &RoundBook {
        &self.rounds
    }

    fn audit_record(&self, job_id: JobId, round: Round, update: &ResolvedUpdate) -> UpdateRecord {
        UpdateRecord {
            job_id,
            participant_id: update.participant_id.clone(),
            round,
            sample_count: update.sample_count,
            payload: RecordedPayload::Raw(update.parameters.clone()),
            accepted_at: unix_now(),
        }
    }
}
