//! In-process simulated participants.
//!
//! Each participant talks to the orchestrator over a `SecureChannel` backed
//! by an in-memory protocol, exactly as a remote node would over TCP. Local
//! "training" is one gradient step toward a hidden per-run target vector, so
//! the global model visibly converges.

use crate::crypto::{ChannelKeyring, KeyringError};
use crate::events::EventSink;
use crate::identity::Principal;
use crate::model::{AggregationResult, JobId, ModelUpdate, ParticipantId};
use crate::orchestrator::{
    JobConfig, JobStatus, Orchestrator, OrchestratorError, OrchestratorSettings,
};
use crate::privacy::ProofTokenGuard;
use crate::registry::{Capability, ComputeTier, Participant, ParticipantClass};
use crate::transport::codec::materialize;
use crate::transport::{
    CodecError, Frame, SecureChannel, TrainingTask,
    TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("job did not finish within {0:?}")]
    Timeout(Duration),
}

/// How a simulated participant responds to tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Honest,
    /// Reports parameters shifted far from anything honest nodes produce
    Faulty { offset: f64 },
    /// Accepts tasks but never reports
    Silent,
}

pub struct SimulatedParticipant {
    participant: Participant,
    target: Arc<Vec<f64>>,
    learning_rate: f64,
    behavior: Behavior,
    proofs: Option<Arc<ProofTokenGuard>>,
}

impl SimulatedParticipant {
    pub fn new(participant: Participant, target: Arc<Vec<f64>>) -> Self {
        Self {
            participant,
            target,
            learning_rate: 0.5,
            behavior: Behavior::Honest,
            proofs: None,
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Attach proof tokens issued by `guard` to every update.
    pub fn with_proofs(mut self, guard: Arc<ProofTokenGuard>) -> Self {
        self.proofs = Some(guard);
        self
    }

    pub fn id(&self) -> &ParticipantId {
        &self.participant.id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// One local step from `global` toward the target. Returns the new
    /// parameters and their mean squared error against the target.
    pub fn train(&self, global: &[f64]) -> (Vec<f64>, f64) {
        let params: Vec<f64> = global
            .iter()
            .zip(self.target.iter())
            .map(|(g, t)| g + self.learning_rate * (t - g))
            .collect();
        let loss = mean_squared_error(&params, &self.target);
        match self.behavior {
            Behavior::Faulty { offset } => (params.iter().map(|p| p + offset).collect(), loss),
            _ => (params, loss),
        }
    }

    /// Build the update for a task, or `None` for a silent participant.
    pub fn respond(&self, task: &TrainingTask) -> Result<Option<ModelUpdate>, CodecError> {
        if self.behavior == Behavior::Silent {
            return Ok(None);
        }
        let global = materialize(&[], &task.global_model)?;
        let (params, loss) = self.train(&global);

        let payload = task.codec.encode_update(&global, &params)?;

        Ok(Some(ModelUpdate {
            job_id: task.job_id,
            participant_id: self.participant.id.clone(),
            round: task.round,
            payload,
            sample_count: self.participant.capability.sample_count,
            training_loss: Some(loss),
            privacy_proof: self
                .proofs
                .as_ref()
                .map(|guard| guard.issue(&task.job_id, &self.participant.id, task.round)),
        }))
    }

    /// Announce, then answer tasks until the channel closes.
    ///
    /// Returns the number of updates sent.
    pub async fn run(self, channel: SecureChannel) -> Result<u32, TransportError> {
        channel.send(&Frame::Hello(self.participant.clone())).await?;
        let mut sent = 0;
        while let Some(frame) = channel.recv().await? {
            match frame {
                Frame::Task(task) => {
                    let update = self
                        .respond(&task)
                        .map_err(|e| TransportError::Codec(e.to_string()))?;
                    if let Some(update) = update {
                        channel.send(&Frame::Update(update)).await?;
                        sent += 1;
                    }
                }
                Frame::Cancel { job_id } => {
                    debug!(participant = %self.participant.id, job = %job_id, "job cancelled");
                }
                _ => {}
            }
        }
        Ok(sent)
    }
}

fn mean_squared_error(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / a.len() as f64
}

/// Shape of a simulated federation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub devices: usize,
    pub organizations: usize,
    pub faulty: usize,
    pub silent: usize,
    pub dimension: usize,
    pub learning_rate: f64,
    pub seed: u64,
    /// Compress sealed frames with LZ4
    pub lz4: bool,
    /// Upper bound on the whole run
    pub deadline: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: 5,
            organizations: 0,
            faulty: 0,
            silent: 0,
            dimension: 16,
            learning_rate: 0.5,
            seed: 7,
            lz4: true,
            deadline: Duration::from_secs(120),
        }
    }
}

impl SimulationConfig {
    pub fn participants(&self) -> usize {
        self.devices + self.organizations
    }

    /// A job that selects everyone and needs the responsive ones for quorum.
    pub fn default_job(&self) -> JobConfig {
        let mut job = JobConfig::new(10, vec![0.0; self.dimension]);
        job.name = Some("simulation".into());
        job.selection.min_participants = self.participants().max(2);
        job.selection.max_participants = self.participants().max(2);
        job.aggregation.quorum = Some(
            self.participants()
                .saturating_sub(self.silent + self.faulty)
                .max(1),
        );
        job.round_timeout = Some(Duration::from_secs(2));
        job
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub rounds: Vec<AggregationResult>,
    pub final_model: Vec<f64>,
    pub target: Vec<f64>,
    /// L2 distance between the final model and the hidden target
    pub distance_to_target: f64,
    pub remaining_epsilon: f64,
}

fn simulated_participant(id: String, class: ParticipantClass, rng: &mut StdRng) -> Participant {
    let capability = match class {
        ParticipantClass::Device => Capability {
            compute_tier: ComputeTier::Low,
            memory_mb: rng.gen_range(1024..4096),
            bandwidth_mbps: rng.gen_range(2.0..50.0),
            sample_count: rng.gen_range(50..500),
            data_quality: rng.gen_range(0.6..1.0),
        },
        ParticipantClass::Organization => Capability {
            compute_tier: ComputeTier::High,
            memory_mb: rng.gen_range(16_384..65_536),
            bandwidth_mbps: rng.gen_range(100.0..1000.0),
            sample_count: rng.gen_range(5_000..50_000),
            data_quality: rng.gen_range(0.8..1.0),
        },
    };
    Participant::new(id, class, capability)
}

/// Run one job against a simulated federation and report the outcome.
pub async fn run_simulation(
    config: &SimulationConfig,
    job: JobConfig,
    sink: Arc<dyn EventSink>,
) -> Result<SimulationReport, SimulationError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let target: Arc<Vec<f64>> = Arc::new(
        (0..config.dimension)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect(),
    );

    let mut secret = [0u8; 32];
    rng.fill(&mut secret);
    let keyring = ChannelKeyring::from_secret(&secret)?;
    let proofs = Arc::new(ProofTokenGuard::new(keyring.proof_secret()));

    let orchestrator = Orchestrator::builder()
        .settings(OrchestratorSettings {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        })
        .event_sink(sink)
        .proof_guard(proofs.clone())
        .with_transport()
        .build();

    let classes = std::iter::repeat(ParticipantClass::Device)
        .take(config.devices)
        .chain(std::iter::repeat(ParticipantClass::Organization).take(config.organizations));
    let mut sims = Vec::new();
    for (i, class) in classes.enumerate() {
        let id = format!("{}-{:03}", class, i);
        let participant = simulated_participant(id, class, &mut rng);
        orchestrator.register_participant(participant.clone()).await?;

        let behavior = if i < config.faulty {
            Behavior::Faulty { offset: 50.0 }
        } else if i < config.faulty + config.silent {
            Behavior::Silent
        } else {
            Behavior::Honest
        };
        let mut sim = SimulatedParticipant::new(participant, Arc::clone(&target))
            .with_behavior(behavior)
            .with_learning_rate(config.learning_rate);
        if job.privacy.require_proof {
            sim = sim.with_proofs(Arc::clone(&proofs));
        }
        sims.push(sim);
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for sim in sims {
        let key = keyring.channel_key(sim.id())?;
        let (coordinator, remote) = SecureChannel::memory_pair(sim.id().clone(), &key, config.lz4)?;
        orchestrator.attach_channel(coordinator)?;
        tasks.push(tokio::spawn(async move {
            let id = sim.id().clone();
            match sim.run(remote).await {
                Ok(sent) => debug!(participant = %id, sent, "simulated participant finished"),
                Err(e) => debug!(participant = %id, error = %e, "simulated participant stopped"),
            }
        }));
    }

    let job_id = orchestrator
        .start_job(&Principal::operator("simulation"), job)
        .await?;
    info!(job = %job_id, participants = config.participants(), "simulation started");

    let finished = tokio::time::timeout(config.deadline, orchestrator.wait_for_completion(job_id)).await;
    let status = match finished {
        Ok(status) => status?,
        Err(_) => {
            let _ = orchestrator
                .stop_job(&Principal::operator("simulation"), job_id)
                .await;
            orchestrator.shutdown().await;
            return Err(SimulationError::Timeout(config.deadline));
        }
    };

    let rounds = orchestrator.results(job_id)?;
    let final_model = orchestrator.global_model(job_id)?;
    let remaining_epsilon = orchestrator.remaining_epsilon(job_id)?;
    orchestrator.shutdown().await;
    for task in tasks {
        task.abort();
    }

    let distance_to_target = final_model
        .iter()
        .zip(target.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>()
        .sqrt();
    Ok(SimulationReport {
        job_id,
        status,
        rounds,
        final_model,
        target: target.as_ref().clone(),
        distance_to_target,
        remaining_epsilon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdatePayload;
    use crate::privacy::PrivacyGuard;
    use crate::transport::CompressionCodec;

    fn sim(behavior: Behavior) -> SimulatedParticipant {
        let mut rng = StdRng::seed_from_u64(1);
        let participant = simulated_participant("device-000".into(), ParticipantClass::Device, &mut rng);
        SimulatedParticipant::new(participant, Arc::new(vec![1.0, -1.0, 0.5, 0.0]))
            .with_behavior(behavior)
    }

    fn task(codec: CompressionCodec) -> TrainingTask {
        TrainingTask {
            job_id: JobId::new(),
            round: 1,
            global_model: UpdatePayload::Dense(vec![0.0; 4]),
            codec,
            deadline_secs: 10,
        }
    }

    #[test]
    fn test_training_moves_toward_target() {
        let (params, loss) = sim(Behavior::Honest).train(&[0.0; 4]);
        assert_eq!(params, vec![0.5, -0.5, 0.25, 0.0]);
        assert!(loss > 0.0);
        let (_, next_loss) = sim(Behavior::Honest).train(&params);
        assert!(next_loss < loss);
    }

    #[test]
    fn test_silent_participant_does_not_respond() {
        let silent = sim(Behavior::Silent);
        assert!(silent.respond(&task(CompressionCodec::Exact)).unwrap().is_none());
    }

    #[test]
    fn test_top_k_task_yields_sparse_delta() {
        let honest = sim(Behavior::Honest);
        let update = honest
            .respond(&task(CompressionCodec::TopK { keep_ratio: 0.25 }))
            .unwrap()
            .unwrap();
        match update.payload {
            UpdatePayload::SparseDelta(delta) => {
                assert_eq!(delta.nnz(), 1);
                assert_eq!(delta.indices, vec![0]);
            }
            other => panic!("expected sparse delta, got {:?}", other),
        }
    }

    #[test]
    fn test_proofs_attached_when_configured() {
        let guard = Arc::new(ProofTokenGuard::new(&[9u8; 32]));
        let honest = sim(Behavior::Honest).with_proofs(Arc::clone(&guard));
        let update = honest
            .respond(&task(CompressionCodec::Lossless))
            .unwrap()
            .unwrap();
        assert!(matches!(update.payload, UpdatePayload::Compressed(_)));
        assert!(guard.verify(&update).is_ok());
    }

    #[test]
    fn test_default_job_quorum_excludes_silent() {
        let config = SimulationConfig {
            devices: 6,
            silent: 2,
            ..Default::default()
        };
        let job = config.default_job();
        assert_eq!(job.quorum(), 4);
        assert_eq!(job.selection.min_participants, 6);
        assert!(job.validate().is_ok());
    }
}
