//! Privacy policy boundary.
//!
//! The engine does not implement differential privacy itself. It charges a
//! configured epsilon cost per update or per round, and asks a pluggable
//! `PrivacyGuard` whether an update carries acceptable privacy evidence.

use crate::model::{JobId, ModelUpdate, ParticipantId, Round};
use hkdf::Hkdf;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// When the epsilon cost is charged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PrivacyMechanism {
    /// Charge `cost` for every accepted update
    PerUpdate { cost: f64 },
    /// Charge `cost` once before each round is dispatched
    PerRound { cost: f64 },
}

impl PrivacyMechanism {
    pub fn cost(&self) -> f64 {
        match self {
            PrivacyMechanism::PerUpdate { cost } | PrivacyMechanism::PerRound { cost } => *cost,
        }
    }
}

impl Default for PrivacyMechanism {
    fn default() -> Self {
        PrivacyMechanism::PerRound { cost: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrivacyViolation {
    #[error("update carries no privacy proof")]
    MissingProof,

    #[error("privacy proof does not verify")]
    InvalidProof,
}

/// Decides whether an update's privacy evidence is acceptable.
pub trait PrivacyGuard: Send + Sync {
    fn verify(&self, update: &ModelUpdate) -> Result<(), PrivacyViolation>;
}

/// Accepts every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGuard;

impl PrivacyGuard for NoopGuard {
    fn verify(&self, _update: &ModelUpdate) -> Result<(), PrivacyViolation> {
        Ok(())
    }
}

/// Requires an HMAC-SHA256 proof token bound to (job, participant, round).
///
/// The token stands in for a real DP attestation; participants holding the
/// shared attestation secret can produce it with `issue`.
pub struct ProofTokenGuard {
    secret: Zeroizing<Vec<u8>>,
}

impl ProofTokenGuard {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    fn job_key(&self, job_id: &JobId) -> hmac::Key {
        let hkdf = Hkdf::<Sha256>::new(Some(b"cohort-privacy-proof-v1"), &self.secret);
        let mut okm = Zeroizing::new([0u8; 32]);
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hkdf.expand(job_id.as_uuid().as_bytes(), &mut okm[..]);
        hmac::Key::new(hmac::HMAC_SHA256, &okm[..])
    }

    fn message(participant: &ParticipantId, round: Round) -> Vec<u8> {
        let mut msg = participant.as_str().as_bytes().to_vec();
        msg.push(0);
        msg.extend_from_slice(&round.to_be_bytes());
        msg
    }

    /// Produce the token a participant attaches to its update.
    pub fn issue(&self, job_id: &JobId, participant: &ParticipantId, round: Round) -> String {
        let tag = hmac::sign(&self.job_key(job_id), &Self::message(participant, round));
        hex::encode(tag.as_ref())
    }
}

impl PrivacyGuard for ProofTokenGuard {
    fn verify(&self, update: &ModelUpdate) -> Result<(), PrivacyViolation> {
        let token = update
            .privacy_proof
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(PrivacyViolation::MissingProof)?;
        let tag = hex::decode(token).map_err(|_| PrivacyViolation::InvalidProof)?;
        hmac::verify(
            &self.job_key(&update.job_id),
            &Self::message(&update.participant_id, update.round),
            &tag,
        )
        .map_err(|_| PrivacyViolation::InvalidProof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdatePayload;

    fn update(job_id: JobId, round: Round, proof: Option<String>) -> ModelUpdate {
        ModelUpdate {
            job_id,
            participant_id: ParticipantId::new("p1"),
            round,
            payload: UpdatePayload::Dense(vec![1.0]),
            sample_count: 10,
            training_loss: None,
            privacy_proof: proof,
        }
    }

    #[test]
    fn test_noop_guard_accepts_everything() {
        assert!(NoopGuard.verify(&update(JobId::new(), 1, None)).is_ok());
    }

    #[test]
    fn test_issued_token_verifies() {
        let guard = ProofTokenGuard::new(b"attestation-secret");
        let job = JobId::new();
        let token = guard.issue(&job, &ParticipantId::new("p1"), 2);
        assert!(guard.verify(&update(job, 2, Some(token))).is_ok());
    }

    #[test]
    fn test_token_bound_to_round() {
        let guard = ProofTokenGuard::new(b"attestation-secret");
        let job = JobId::new();
        let token = guard.issue(&job, &ParticipantId::new("p1"), 1);
        assert_eq!(
            guard.verify(&update(job, 2, Some(token))),
            Err(PrivacyViolation::InvalidProof)
        );
    }

    #[test]
    fn test_missing_and_malformed_tokens() {
        let guard = ProofTokenGuard::new(b"attestation-secret");
        let job = JobId::new();
        assert_eq!(
            guard.verify(&update(job, 1, None)),
            Err(PrivacyViolation::MissingProof)
        );
        assert_eq!(
            guard.verify(&update(job, 1, Some("zz-not-hex".into()))),
            Err(PrivacyViolation::InvalidProof)
        );
    }

    #[test]
    fn test_mechanism_cost() {
        assert_eq!(PrivacyMechanism::PerUpdate { cost: 0.2 }.cost(), 0.2);
        assert_eq!(PrivacyMechanism::PerRound { cost: 0.6 }.cost(), 0.6);
    }
}
