//! Organization-scale adapter: few reliable, high-capacity participants.
//!
//! Transport is exact (LZ4 over CBOR). Individual updates are never written
//! to the audit trail or emitted; only a SHA-256 commitment over
//! (job, participant, round, parameters) is kept, so nothing downstream of
//! the round sees a single participant's raw update.

use super::{AdapterKind, AdapterProfile, FrameworkAdapter, RoundBook};
use crate::aggregation::AggregationAlgorithm;
use crate::model::{unix_now, JobId, RecordedPayload, ResolvedUpdate, Round, UpdateRecord};
use crate::transport::CompressionCodec;
use sha2::{Digest, Sha256};

pub struct OrganizationAdapter {
    profile: AdapterProfile,
    rounds: RoundBook,
}

impl OrganizationAdapter {
    pub fn new() -> Self {
        Self {
            profile: AdapterProfile {
                kind: AdapterKind::Organization,
                codec: CompressionCodec::Lossless,
                timeout_multiplier: 1,
                default_algorithm: AggregationAlgorithm::WeightedAverage,
                sealed_records: true,
            },
            rounds: RoundBook::new(),
        }
    }
}

impl Default for OrganizationAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex SHA-256 commitment to one participant's update.
pub fn commitment(job_id: &JobId, update: &ResolvedUpdate, round: Round) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_uuid().as_bytes());
    hasher.update(update.participant_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(round.to_be_bytes());
    hasher.update(update.sample_count.to_be_bytes());
    for value in &update.parameters {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

impl FrameworkAdapter for OrganizationAdapter {
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
            payload: RecordedPayload::Sealed {
                digest: commitment(&job_id, update, round),
            },
            accepted_at: unix_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RoundSpec;
    use crate::model::{ModelUpdate, ParticipantId, UpdatePayload};
    use crate::privacy::NoopGuard;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_profile_defaults() {
        let adapter = OrganizationAdapter::new();
        assert_eq!(adapter.kind(), AdapterKind::Organization);
        assert_eq!(adapter.default_algorithm(), AggregationAlgorithm::WeightedAverage);
        assert!(!adapter.profile().codec.is_lossy());
        assert!(adapter.profile().sealed_records);
    }

    #[test]
    fn test_lossless_update_recorded_as_commitment_only() {
        let adapter = OrganizationAdapter::new();
        let job_id = JobId::new();
        let global = vec![0.5, -0.25, 3.0];
        let dispatch = adapter
            .start_round(RoundSpec {
                job_id,
                round: 1,
                global_model: Arc::new(global.clone()),
                previous_model: None,
                participants: vec![ParticipantId::new("hospital-a")],
                quorum: 1,
                base_timeout: Duration::from_secs(10),
                guard: Arc::new(NoopGuard),
                charge: None,
                carried: Vec::new(),
            })
            .unwrap();
        assert_eq!(dispatch.timeout, Duration::from_secs(10));
        assert!(matches!(dispatch.task.global_model, UpdatePayload::Compressed(_)));

        let params = vec![0.123456789, -0.25, 3.000001];
        let payload = adapter.profile().codec.encode_update(&global, &params).unwrap();
        let admission = adapter
            .collect_update(&ModelUpdate {
                job_id,
                participant_id: ParticipantId::new("hospital-a"),
                round: 1,
                payload,
                sample_count: 1000,
                training_loss: Some(0.2),
                privacy_proof: None,
            })
            .unwrap();

        let expected = commitment(
            &job_id,
            &ResolvedUpdate {
                participant_id: ParticipantId::new("hospital-a"),
                parameters: params.clone(),
                sample_count: 1000,
                training_loss: Some(0.2),
            },
            1,
        );
        assert_eq!(
            admission.record.payload,
            RecordedPayload::Sealed { digest: expected }
        );

        let harvest = dispatch.collector.begin_aggregation().unwrap();
        assert_eq!(harvest.updates[0].parameters, params);
    }
}
