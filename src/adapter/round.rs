//! Round protocol shared by every framework adapter.
//!
//! A `RoundCollector` owns one (job, round) collection window:
//!
//! - accepts updates from selected participants while collecting
//! - wakes the job loop once the quorum is reached (`Notify`)
//! - hands out the accepted updates exactly once (`AtomicBool` CAS); updates
//!   arriving after that are deferred to the next round
//!
//! `RoundBook` tracks the open collector and deferred updates per job.

use super::AdapterError;
use crate::model::{JobId, ModelUpdate, ParticipantId, ResolvedUpdate, Round};
use crate::privacy::{Consumption, PrivacyBudgetTracker, PrivacyGuard};
use crate::transport::codec::materialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Epsilon charged per accepted update.
#[derive(Clone)]
pub struct UpdateCharge {
    pub tracker: Arc<PrivacyBudgetTracker>,
    pub cost: f64,
}

/// Everything needed to open a round.
#[derive(Clone)]
pub struct RoundSpec {
    pub job_id: JobId,
    pub round: Round,
    pub global_model: Arc<Vec<f64>>,
    /// Global model of the previous round, for late updates
    pub previous_model: Option<Arc<Vec<f64>>>,
    pub participants: Vec<ParticipantId>,
    pub quorum: usize,
    pub base_timeout: Duration,
    pub guard: Arc<dyn PrivacyGuard>,
    pub charge: Option<UpdateCharge>,
    /// Updates already accepted by a failed attempt of this round
    pub carried: Vec<ResolvedUpdate>,
}

/// What woke the job loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Quorum,
    Timeout,
    BudgetExhausted,
}

/// Updates handed to the aggregator.
#[derive(Debug)]
pub struct Harvest {
    /// Canonical (participant id) order
    pub updates: Vec<ResolvedUpdate>,
    pub budget_exhausted: bool,
}

#[derive(Debug)]
pub(crate) enum Offer {
    Accepted {
        resolved: ResolvedUpdate,
        accepted: usize,
        quorum_reached: bool,
    },
    Deferred {
        resolved: ResolvedUpdate,
    },
}

#[derive(Default)]
struct CollectorState {
    accepted: BTreeMap<ParticipantId, ResolvedUpdate>,
    /// Entries that came from the previous round; a fresh update replaces them
    late: BTreeSet<ParticipantId>,
    budget_exhausted: bool,
}

/// Collection window for one (job, round).
pub struct RoundCollector {
    job_id: JobId,
    round: Round,
    global_model: Arc<Vec<f64>>,
    previous_model: Option<Arc<Vec<f64>>>,
    expected: BTreeSet<ParticipantId>,
    quorum: usize,
    guard: Arc<dyn PrivacyGuard>,
    charge: Option<UpdateCharge>,
    state: Mutex<CollectorState>,
    aggregation_started: AtomicBool,
    trigger: Notify,
}

impl RoundCollector {
    pub fn new(spec: &RoundSpec) -> Self {
        Self {
            job_id: spec.job_id,
            round: spec.round,
            global_model: Arc::clone(&spec.global_model),
            previous_model: spec.previous_model.clone(),
            expected: spec.participants.iter().cloned().collect(),
            quorum: spec.quorum.max(1),
            guard: Arc::clone(&spec.guard),
            charge: spec.charge.clone(),
            state: Mutex::new(CollectorState::default()),
            aggregation_started: AtomicBool::new(false),
            trigger: Notify::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn global_model(&self) -> &Arc<Vec<f64>> {
        &self.global_model
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn accepted_count(&self) -> usize {
        self.lock().accepted.len()
    }

    pub fn has_update(&self, participant: &ParticipantId) -> bool {
        self.lock().accepted.contains_key(participant)
    }

    pub fn is_claimed(&self) -> bool {
        self.aggregation_started.load(Ordering::Acquire)
    }

    /// Validate and materialize an update, then admit or defer it.
    pub(crate) fn offer(&self, update: &ModelUpdate) -> Result<Offer, AdapterError> {
        let participant = &update.participant_id;
        let late = if update.round == self.round {
            false
        } else if update.round + 1 == self.round && self.previous_model.is_some() {
            true
        } else if update.round < self.round {
            return Err(AdapterError::StaleRound {
                participant: participant.clone(),
                got: update.round,
                current: self.round,
            });
        } else {
            return Err(AdapterError::FutureRound {
                participant: participant.clone(),
                got: update.round,
                current: self.round,
            });
        };

        if !self.expected.contains(participant) {
            return Err(AdapterError::NotSelected(participant.clone()));
        }
        self.guard
            .verify(update)
            .map_err(|violation| AdapterError::Privacy {
                participant: participant.clone(),
                violation,
            })?;
        if update.sample_count == 0 {
            return Err(AdapterError::Malformed {
                participant: participant.clone(),
                reason: "zero sample count".into(),
            });
        }

        let base = match (&self.previous_model, late) {
            (Some(previous), true) => previous,
            _ => &self.global_model,
        };
        let parameters =
            materialize(base, &update.payload).map_err(|e| AdapterError::Malformed {
                participant: participant.clone(),
                reason: e.to_string(),
            })?;
        if parameters.len() != self.global_model.len() {
            return Err(AdapterError::Malformed {
                participant: participant.clone(),
                reason: format!(
                    "dimension {} does not match global model dimension {}",
                    parameters.len(),
                    self.global_model.len()
                ),
            });
        }

        let resolved = ResolvedUpdate {
            participant_id: participant.clone(),
            parameters,
            sample_count: update.sample_count,
            training_loss: update.training_loss,
        };

        let mut state = self.lock();
        if state.budget_exhausted {
            return Err(AdapterError::BudgetExhausted);
        }
        // Checked under the state lock; `begin_aggregation` flips the flag
        // before taking the lock, so every update lands on exactly one side.
        if self.aggregation_started.load(Ordering::Acquire) {
            return Ok(Offer::Deferred { resolved });
        }
        self.admit(&mut state, resolved, late, true)
    }

    fn admit(
        &self,
        state: &mut CollectorState,
        resolved: ResolvedUpdate,
        late: bool,
        charge: bool,
    ) -> Result<Offer, AdapterError> {
        let participant = resolved.participant_id.clone();
        if state.accepted.contains_key(&participant) {
            if late || !state.late.remove(&participant) {
                return Err(AdapterError::Duplicate {
                    participant,
                    round: self.round,
                });
            }
            state.accepted.insert(participant, resolved.clone());
        } else {
            if charge {
                self.charge(state)?;
            }
            if late {
                state.late.insert(participant.clone());
            }
            state.accepted.insert(participant, resolved.clone());
        }

        let accepted = state.accepted.len();
        let quorum_reached = accepted >= self.quorum;
        if quorum_reached {
            self.trigger.notify_one();
        }
        Ok(Offer::Accepted {
            resolved,
            accepted,
            quorum_reached,
        })
    }

    fn charge(&self, state: &mut CollectorState) -> Result<(), AdapterError> {
        let Some(charge) = &self.charge else {
            return Ok(());
        };
        match charge.tracker.try_consume(self.job_id, charge.cost)? {
            Consumption::Accepted { .. } => Ok(()),
            Consumption::Rejected { .. } => {
                state.budget_exhausted = true;
                self.trigger.notify_one();
                Err(AdapterError::BudgetExhausted)
            }
        }
    }

    /// Insert updates a previous attempt of this round already paid for.
    fn seed(&self, updates: Vec<ResolvedUpdate>) {
        let mut state = self.lock();
        for update in updates {
            if self.expected.contains(&update.participant_id) {
                state.accepted.insert(update.participant_id.clone(), update);
            }
        }
    }

    /// Take over an update deferred from an earlier window.
    fn adopt(&self, resolved: ResolvedUpdate, late: bool) -> Result<(), AdapterError> {
        if !self.expected.contains(&resolved.participant_id) {
            return Err(AdapterError::NotSelected(resolved.participant_id));
        }
        let mut state = self.lock();
        if state.budget_exhausted {
            return Err(AdapterError::BudgetExhausted);
        }
        self.admit(&mut state, resolved, late, true).map(|_| ())
    }

    /// Wait until quorum, budget exhaustion, or `timeout`.
    pub async fn wait_for_trigger(&self, timeout: Duration) -> Trigger {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.lock();
                if state.budget_exhausted {
                    return Trigger::BudgetExhausted;
                }
                if state.accepted.len() >= self.quorum {
                    return Trigger::Quorum;
                }
            }
            if tokio::time::timeout_at(deadline, self.trigger.notified())
                .await
                .is_err()
            {
                return Trigger::Timeout;
            }
        }
    }

    /// Claim the round for aggregation. Succeeds at most once.
    pub fn begin_aggregation(&self) -> Option<Harvest> {
        if self
            .aggregation_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let mut state = self.lock();
        let updates = std::mem::take(&mut state.accepted).into_values().collect();
        state.late.clear();
        Some(Harvest {
            updates,
            budget_exhausted: state.budget_exhausted,
        })
    }
}

struct DeferredUpdate {
    source_round: Round,
    resolved: ResolvedUpdate,
}

struct JobRounds {
    current: Arc<RoundCollector>,
    deferred: BTreeMap<ParticipantId, DeferredUpdate>,
}

/// Open rounds and deferred updates, per job.
#[derive(Default)]
pub struct RoundBook {
    jobs: Mutex<HashMap<JobId, JobRounds>>,
}

impl RoundBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRounds>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new collection window for `spec.job_id`, replacing any previous one.
    pub(crate) fn open_round(&self, spec: RoundSpec) -> Arc<RoundCollector> {
        let collector = Arc::new(RoundCollector::new(&spec));
        collector.seed(spec.carried);

        let mut jobs = self.lock();
        let deferred = jobs
            .remove(&spec.job_id)
            .map(|rounds| rounds.deferred)
            .unwrap_or_default();
        for (participant, entry) in deferred {
            let late = if entry.source_round == spec.round {
                false
            } else if entry.source_round + 1 == spec.round {
                true
            } else {
                debug!(job = %spec.job_id, participant = %participant, "dropping expired deferred update");
                continue;
            };
            if let Err(e) = collector.adopt(entry.resolved, late) {
                debug!(job = %spec.job_id, participant = %participant, error = %e, "deferred update not adopted");
            }
        }

        jobs.insert(
            spec.job_id,
            JobRounds {
                current: Arc::clone(&collector),
                deferred: BTreeMap::new(),
            },
        );
        collector
    }

    /// Route an update to its job's open window.
    pub(crate) fn collect(&self, update: &ModelUpdate) -> Result<(Round, Offer), AdapterError> {
        let mut jobs = self.lock();
        let rounds = jobs
            .get_mut(&update.job_id)
            .ok_or(AdapterError::NoActiveRound(update.job_id))?;
        let current_round = rounds.current.round();
        let offer = rounds.current.offer(update)?;
        if let Offer::Deferred { resolved } = &offer {
            rounds.deferred.insert(
                resolved.participant_id.clone(),
                DeferredUpdate {
                    source_round: current_round,
                    resolved: resolved.clone(),
                },
            );
        }
        Ok((current_round, offer))
    }

    pub fn current(&self, job_id: &JobId) -> Option<Arc<RoundCollector>> {
        self.lock().get(job_id).map(|r| Arc::clone(&r.current))
    }

    /// Forget a job; later updates for it are rejected.
    pub(crate) fn close_job(&self, job_id: &JobId) -> Option<Arc<RoundCollector>> {
        self.lock().remove(job_id).map(|r| r.current)
    }

    pub fn active_jobs(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdatePayload;
    use crate::privacy::{NoopGuard, ProofTokenGuard};

    fn ids(n: usize) -> Vec<ParticipantId> {
        (0..n).map(|i| ParticipantId::new(format!("p{}", i))).collect()
    }

    fn spec(job_id: JobId, round: Round, quorum: usize) -> RoundSpec {
        RoundSpec {
            job_id,
            round,
            global_model: Arc::new(vec![0.0]),
            previous_model: (round > 1).then(|| Arc::new(vec![0.0])),
            participants: ids(5),
            quorum,
            base_timeout: Duration::from_secs(1),
            guard: Arc::new(NoopGuard),
            charge: None,
            carried: Vec::new(),
        }
    }

    fn update(job_id: JobId, participant: &str, round: Round, value: f64) -> ModelUpdate {
        ModelUpdate {
            job_id,
            participant_id: ParticipantId::new(participant),
            round,
            payload: UpdatePayload::Dense(vec![value]),
            sample_count: 10,
            training_loss: None,
            privacy_proof: None,
        }
    }

    #[test]
    fn test_quorum_reached_on_third_update() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 1, 3));
        for (i, id) in ["p0", "p1", "p2"].iter().enumerate() {
            match collector.offer(&update(job, id, 1, 1.0)).unwrap() {
                Offer::Accepted {
                    accepted,
                    quorum_reached,
                    ..
                } => {
                    assert_eq!(accepted, i + 1);
                    assert_eq!(quorum_reached, i == 2);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_rejections() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 2, 3));
        collector.offer(&update(job, "p0", 2, 1.0)).unwrap();

        assert!(matches!(
            collector.offer(&update(job, "p0", 2, 1.0)),
            Err(AdapterError::Duplicate { .. })
        ));
        assert!(matches!(
            collector.offer(&update(job, "stranger", 2, 1.0)),
            Err(AdapterError::NotSelected(_))
        ));
        assert!(matches!(
            collector.offer(&update(job, "p1", 3, 1.0)),
            Err(AdapterError::FutureRound { .. })
        ));
        let mut wrong_dim = update(job, "p1", 2, 1.0);
        wrong_dim.payload = UpdatePayload::Dense(vec![1.0, 2.0]);
        assert!(matches!(
            collector.offer(&wrong_dim),
            Err(AdapterError::Malformed { .. })
        ));
        let mut no_samples = update(job, "p1", 2, 1.0);
        no_samples.sample_count = 0;
        assert!(matches!(
            collector.offer(&no_samples),
            Err(AdapterError::Malformed { .. })
        ));
    }

    #[test]
    fn test_stale_round_rejected() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 3, 3));
        assert!(matches!(
            collector.offer(&update(job, "p0", 1, 1.0)),
            Err(AdapterError::StaleRound { got: 1, current: 3, .. })
        ));
    }

    #[test]
    fn test_fresh_update_supersedes_late_one() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 2, 3));
        collector.offer(&update(job, "p0", 1, 5.0)).unwrap();
        // A second late update is a duplicate, the fresh one replaces it
        assert!(collector.offer(&update(job, "p0", 1, 6.0)).is_err());
        collector.offer(&update(job, "p0", 2, 1.0)).unwrap();
        assert_eq!(collector.accepted_count(), 1);

        let harvest = collector.begin_aggregation().unwrap();
        assert_eq!(harvest.updates[0].parameters, vec![1.0]);
    }

    #[test]
    fn test_privacy_guard_is_enforced() {
        let job = JobId::new();
        let mut round_spec = spec(job, 1, 1);
        round_spec.guard = Arc::new(ProofTokenGuard::new(b"secret"));
        let collector = RoundCollector::new(&round_spec);
        assert!(matches!(
            collector.offer(&update(job, "p0", 1, 1.0)),
            Err(AdapterError::Privacy { .. })
        ));
    }

    #[test]
    fn test_begin_aggregation_only_once() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 1, 1));
        collector.offer(&update(job, "p1", 1, 1.0)).unwrap();
        collector.offer(&update(job, "p0", 1, 2.0)).unwrap();

        let harvest = collector.begin_aggregation().unwrap();
        let order: Vec<_> = harvest.updates.iter().map(|u| u.participant_id.as_str()).collect();
        assert_eq!(order, vec!["p0", "p1"]);
        assert!(collector.begin_aggregation().is_none());
        assert!(collector.is_claimed());
    }

    #[test]
    fn test_updates_after_claim_are_deferred_to_next_round() {
        let job = JobId::new();
        let book = RoundBook::new();
        let first = book.open_round(spec(job, 1, 3));
        book.collect(&update(job, "p0", 1, 1.0)).unwrap();
        first.begin_aggregation().unwrap();

        let (round, offer) = book.collect(&update(job, "p1", 1, 2.0)).unwrap();
        assert_eq!(round, 1);
        assert!(matches!(offer, Offer::Deferred { .. }));

        let second = book.open_round(spec(job, 2, 3));
        assert!(second.has_update(&ParticipantId::new("p1")));
        assert!(!second.has_update(&ParticipantId::new("p0")));

        // Fresh round-2 update replaces the deferred one
        book.collect(&update(job, "p1", 2, 3.0)).unwrap();
        let harvest = second.begin_aggregation().unwrap();
        assert_eq!(harvest.updates.len(), 1);
        assert_eq!(harvest.updates[0].parameters, vec![3.0]);
    }

    #[test]
    fn test_carried_updates_seed_retry() {
        let job = JobId::new();
        let book = RoundBook::new();
        let mut retry = spec(job, 1, 2);
        retry.carried = vec![ResolvedUpdate {
            participant_id: ParticipantId::new("p3"),
            parameters: vec![1.0],
            sample_count: 10,
            training_loss: None,
        }];
        let collector = book.open_round(retry);
        assert_eq!(collector.accepted_count(), 1);
        assert!(book.collect(&update(job, "p3", 1, 1.0)).is_err());
    }

    #[test]
    fn test_per_update_charge_exhausts_budget() {
        let job = JobId::new();
        let tracker = Arc::new(PrivacyBudgetTracker::new());
        tracker.initialize(job, 1.0).unwrap();
        let mut round_spec = spec(job, 1, 5);
        round_spec.charge = Some(UpdateCharge {
            tracker: Arc::clone(&tracker),
            cost: 0.4,
        });
        let collector = RoundCollector::new(&round_spec);

        collector.offer(&update(job, "p0", 1, 1.0)).unwrap();
        collector.offer(&update(job, "p1", 1, 1.0)).unwrap();
        assert!(matches!(
            collector.offer(&update(job, "p2", 1, 1.0)),
            Err(AdapterError::BudgetExhausted)
        ));
        assert!(matches!(
            collector.offer(&update(job, "p3", 1, 1.0)),
            Err(AdapterError::BudgetExhausted)
        ));
        let harvest = collector.begin_aggregation().unwrap();
        assert!(harvest.budget_exhausted);
        assert!((tracker.remaining(job).unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_job_rejected() {
        let book = RoundBook::new();
        let job = JobId::new();
        assert!(matches!(
            book.collect(&update(job, "p0", 1, 1.0)),
            Err(AdapterError::NoActiveRound(_))
        ));
        book.open_round(spec(job, 1, 1));
        assert_eq!(book.active_jobs(), 1);
        assert!(book.close_job(&job).is_some());
        assert!(book.current(&job).is_none());
    }

    #[tokio::test]
    async fn test_trigger_fires_on_quorum() {
        let job = JobId::new();
        let collector = Arc::new(RoundCollector::new(&spec(job, 1, 2)));
        let waiter = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.wait_for_trigger(Duration::from_secs(30)).await })
        };
        collector.offer(&update(job, "p0", 1, 1.0)).unwrap();
        collector.offer(&update(job, "p1", 1, 1.0)).unwrap();
        assert_eq!(waiter.await.unwrap(), Trigger::Quorum);
    }

    #[tokio::test]
    async fn test_trigger_times_out_below_quorum() {
        let job = JobId::new();
        let collector = RoundCollector::new(&spec(job, 1, 3));
        collector.offer(&update(job, "p0", 1, 1.0)).unwrap();
        assert_eq!(
            collector.wait_for_trigger(Duration::from_millis(20)).await,
            Trigger::Timeout
        );
        assert_eq!(collector.accepted_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_aggregate_once() {
        let job = JobId::new();
        let collector = Arc::new(RoundCollector::new(&spec(job, 1, 1)));
        collector.offer(&update(job, "p0", 1, 1.0)).unwrap();

        // Quorum path and timeout path race for the same round
        let quorum = {
            let c = Arc::clone(&collector);
            tokio::spawn(async move {
                c.wait_for_trigger(Duration::from_secs(5)).await;
                c.begin_aggregation().is_some()
            })
        };
        let timeout = {
            let c = Arc::clone(&collector);
            tokio::spawn(async move {
                c.wait_for_trigger(Duration::ZERO).await;
                c.begin_aggregation().is_some()
            })
        };
        let claims = [quorum.await.unwrap(), timeout.await.unwrap()];
        assert_eq!(claims.iter().filter(|c| **c).count(), 1);
    }
}
