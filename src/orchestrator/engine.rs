//! The orchestrator handle and each job's round loop.

use super::convergence::Verdict;
use super::job::{FailureReason, JobConfig, JobSnapshot, JobStatus, RoundPhase};
use super::{OrchestratorError, OrchestratorResult};
use crate::adapter::{
    select_adapter, Admission, AdapterKind, DeviceAdapter, FrameworkAdapter, OrganizationAdapter,
    RoundSpec, Trigger, UpdateCharge,
};
use crate::aggregation::{AggregationError, RobustAggregator, RoundBaseline};
use crate::events::{EventSink, LifecycleEvent, ThreatKind, TracingSink};
use crate::identity::{Action, Authorizer, Principal, RoleAuthorizer};
use crate::model::{unix_now, AggregationResult, JobId, ModelUpdate, ParticipantId, ResolvedUpdate, Round};
use crate::persistence::{JournalEntry, JournalStore, MemoryJournal};
use crate::privacy::{Consumption, NoopGuard, PrivacyBudgetTracker, PrivacyGuard, PrivacyMechanism};
use crate::registry::{
    Participant, ParticipantRegistry, ParticipantStatus, RegistryError, DEFAULT_REGISTRY_CAPACITY,
};
use crate::transport::{Frame, SecureChannel, TransportEvent, TransportHub};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-wide orchestrator knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Base round timeout when a job does not set its own
    pub round_timeout: Duration,
    /// Silence after which a participant is marked offline
    pub heartbeat_timeout: Duration,
    /// How often to sweep for silent participants (zero disables)
    pub sweep_interval: Duration,
    pub registry_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

/// What `recover` rebuilt from the journal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub participants: usize,
    pub jobs: usize,
    /// Jobs that were still running and are now failed
    pub interrupted: Vec<JobId>,
    pub results: usize,
    pub updates: usize,
}

struct JobRecord {
    status: JobStatus,
    current_round: Round,
    rounds_completed: u32,
    results: Vec<AggregationResult>,
    global_model: Arc<Vec<f64>>,
    previous_model: Option<Arc<Vec<f64>>>,
    /// Mean loss of the latest aggregated round
    baseline_loss: Option<f64>,
}

struct JobHandle {
    job_id: JobId,
    config: JobConfig,
    kind: AdapterKind,
    adapter: Arc<dyn FrameworkAdapter>,
    /// Fixed for the lifetime of the job, ordered by id
    participants: Vec<ParticipantId>,
    guard: Arc<dyn PrivacyGuard>,
    record: Mutex<JobRecord>,
    status_tx: watch::Sender<JobStatus>,
    cancel_tx: watch::Sender<bool>,
}

impl JobHandle {
    fn new(
        job_id: JobId,
        config: JobConfig,
        kind: AdapterKind,
        adapter: Arc<dyn FrameworkAdapter>,
        participants: Vec<ParticipantId>,
        guard: Arc<dyn PrivacyGuard>,
    ) -> Self {
        let global_model = Arc::new(config.initial_parameters.clone());
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            job_id,
            config,
            kind,
            adapter,
            participants,
            guard,
            record: Mutex::new(JobRecord {
                status: JobStatus::Pending,
                current_round: 0,
                rounds_completed: 0,
                results: Vec::new(),
                global_model,
                previous_model: None,
                baseline_loss: None,
            }),
            status_tx,
            cancel_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> JobStatus {
        self.lock().status.clone()
    }

    fn quorum(&self) -> usize {
        self.config.quorum()
    }
}

enum JobOutcome {
    Completed { converged: bool },
    Failed(FailureReason),
    Cancelled,
}

/// Why a round result was not stored.
#[derive(Debug, PartialEq, Eq)]
enum CommitRefused {
    /// The job reached a terminal state while the round was aggregating
    Terminal,
    AlreadyStored,
}

enum RoundOutcome {
    Aggregated(AggregationResult),
    /// Transient shortfall; the updates worth keeping for the retry
    Retry(Vec<ResolvedUpdate>),
    Fatal(FailureReason),
    Cancelled,
}

struct Inner {
    settings: OrchestratorSettings,
    registry: RwLock<ParticipantRegistry>,
    budgets: Arc<PrivacyBudgetTracker>,
    adapters: HashMap<AdapterKind, Arc<dyn FrameworkAdapter>>,
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    journal: Arc<dyn JournalStore>,
    sink: Arc<dyn EventSink>,
    authorizer: Arc<dyn Authorizer>,
    hub: Option<Arc<TransportHub>>,
    proof_guard: Option<Arc<dyn PrivacyGuard>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap, cloneable handle to a running orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Assembles an `Orchestrator` from its collaborators.
pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    journal: Option<Arc<dyn JournalStore>>,
    sink: Option<Arc<dyn EventSink>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    proof_guard: Option<Arc<dyn PrivacyGuard>>,
    adapters: HashMap<AdapterKind, Arc<dyn FrameworkAdapter>>,
    hub: Option<(Arc<TransportHub>, mpsc::UnboundedReceiver<TransportEvent>)>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            settings: OrchestratorSettings::default(),
            journal: None,
            sink: None,
            authorizer: None,
            proof_guard: None,
            adapters: HashMap::new(),
            hub: None,
        }
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn journal(mut self, journal: Arc<dyn JournalStore>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Guard applied to jobs with `privacy.require_proof`.
    pub fn proof_guard(mut self, guard: Arc<dyn PrivacyGuard>) -> Self {
        self.proof_guard = Some(guard);
        self
    }

    /// Replace the adapter used for its kind.
    pub fn adapter(mut self, adapter: Arc<dyn FrameworkAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Create a transport hub whose events this orchestrator consumes.
    pub fn with_transport(mut self) -> Self {
        self.hub = Some(TransportHub::new());
        self
    }

    /// Build and start background tasks. Must be called inside a tokio runtime.
    pub fn build(self) -> Orchestrator {
        let mut adapters = self.adapters;
        adapters
            .entry(AdapterKind::Device)
            .or_insert_with(|| Arc::new(DeviceAdapter::new()));
        adapters
            .entry(AdapterKind::Organization)
            .or_insert_with(|| Arc::new(OrganizationAdapter::new()));

        let (hub, events) = match self.hub {
            Some((hub, events)) => (Some(hub), Some(events)),
            None => (None, None),
        };

        let inner = Arc::new(Inner {
            registry: RwLock::new(ParticipantRegistry::with_capacity(
                self.settings.registry_capacity,
            )),
            settings: self.settings,
            budgets: Arc::new(PrivacyBudgetTracker::new()),
            adapters,
            jobs: RwLock::new(HashMap::new()),
            journal: self
                .journal
                .unwrap_or_else(|| Arc::new(MemoryJournal::new())),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(RoleAuthorizer::default())),
            hub,
            proof_guard: self.proof_guard,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if let Some(events) = events {
            tasks.push(tokio::spawn(pump_transport(Arc::downgrade(&inner), events)));
        }
        if !inner.settings.sweep_interval.is_zero() {
            tasks.push(tokio::spawn(sweep_loop(
                Arc::downgrade(&inner),
                inner.settings.sweep_interval,
            )));
        }
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        Orchestrator { inner }
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Register (or re-register) a participant.
    pub async fn register_participant(&self, participant: Participant) -> OrchestratorResult<()> {
        self.inner.register_participant(participant).await
    }

    /// Refresh a participant's liveness.
    pub fn heartbeat(&self, participant: &ParticipantId) -> OrchestratorResult<()> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .heartbeat(participant)?;
        Ok(())
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<Participant> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Validate, select participants and launch a job's round loop.
    pub async fn start_job(&self, principal: &Principal, config: JobConfig) -> OrchestratorResult<JobId> {
        self.inner.authorizer.authorize(principal, Action::StartJob)?;
        Arc::clone(&self.inner).start_job(config).await
    }

    /// Cancel a job. Stopping a finished job is a no-op.
    pub async fn stop_job(&self, principal: &Principal, job_id: JobId) -> OrchestratorResult<JobStatus> {
        self.inner.authorizer.authorize(principal, Action::StopJob)?;
        self.inner.stop_job(job_id).await
    }

    /// Hand an update to the job's open round.
    pub async fn submit_update(&self, update: ModelUpdate) -> OrchestratorResult<Admission> {
        self.inner.submit_update(update).await
    }

    pub fn job(&self, job_id: JobId) -> OrchestratorResult<JobSnapshot> {
        let handle = self.inner.handle(job_id)?;
        Ok(self.inner.snapshot(&handle))
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let handles: Vec<_> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        handles.iter().map(|h| self.inner.snapshot(h)).collect()
    }

    /// Subscribe to a job's status changes.
    pub fn watch_job(&self, job_id: JobId) -> OrchestratorResult<watch::Receiver<JobStatus>> {
        Ok(self.inner.handle(job_id)?.status_tx.subscribe())
    }

    /// Wait until the job reaches a terminal state.
    pub async fn wait_for_completion(&self, job_id: JobId) -> OrchestratorResult<JobStatus> {
        let mut rx = self.watch_job(job_id)?;
        let status = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => status.clone(),
            Err(_) => self.inner.handle(job_id)?.status(),
        };
        Ok(status)
    }

    /// Aggregation results in round order.
    pub fn results(&self, job_id: JobId) -> OrchestratorResult<Vec<AggregationResult>> {
        Ok(self.inner.handle(job_id)?.lock().results.clone())
    }

    /// Current global model of a job.
    pub fn global_model(&self, job_id: JobId) -> OrchestratorResult<Vec<f64>> {
        Ok(self.inner.handle(job_id)?.lock().global_model.as_ref().clone())
    }

    pub fn remaining_epsilon(&self, job_id: JobId) -> OrchestratorResult<f64> {
        Ok(self.inner.budgets.remaining(job_id)?)
    }

    pub fn hub(&self) -> Option<&Arc<TransportHub>> {
        self.inner.hub.as_ref()
    }

    /// Take ownership of an accepted participant channel.
    pub fn attach_channel(&self, channel: SecureChannel) -> OrchestratorResult<ParticipantId> {
        let hub = self
            .inner
            .hub
            .as_ref()
            .ok_or(OrchestratorError::TransportUnavailable)?;
        let participant = hub.attach(channel);
        info!(participant = %participant, "participant channel attached");
        Ok(participant)
    }

    /// Rebuild registry, budgets and jobs from the journal.
    pub async fn recover(&self, principal: &Principal) -> OrchestratorResult<RecoveryReport> {
        self.inner
            .authorizer
            .authorize(principal, Action::RecoverJobs)?;
        self.inner.recover().await
    }

    /// Stop background tasks and close every channel.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        if let Some(hub) = &self.inner.hub {
            hub.shutdown().await;
        }
    }
}

impl Inner {
    fn handle(&self, job_id: JobId) -> OrchestratorResult<Arc<JobHandle>> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    fn snapshot(&self, handle: &JobHandle) -> JobSnapshot {
        let record = handle.lock();
        JobSnapshot {
            job_id: handle.job_id,
            name: handle.config.name.clone(),
            status: record.status.clone(),
            adapter: handle.kind,
            participants: handle.participants.clone(),
            current_round: record.current_round,
            rounds_completed: record.rounds_completed,
            target_rounds: handle.config.target_rounds,
            remaining_epsilon: self.budgets.remaining(handle.job_id).unwrap_or(0.0),
            latest_metrics: record.results.last().map(|r| r.metrics.clone()),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.sink.emit(event);
    }

    async fn append_journal(&self, entry: JournalEntry) {
        if let Err(e) = self.journal.append(entry).await {
            error!(error = %e, "journal append failed");
        }
    }

    async fn register_participant(&self, participant: Participant) -> OrchestratorResult<()> {
        let stored = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.register(participant.clone())?;
            registry.get(&participant.id).cloned().unwrap_or(participant)
        };
        if let Err(e) = self.journal.record_participant(&stored).await {
            error!(participant = %stored.id, error = %e, "failed to journal registration");
        }
        info!(participant = %stored.id, class = %stored.class, "participant registered");
        self.emit(LifecycleEvent::ClientRegistered {
            participant: stored.id,
            class: stored.class,
        });
        Ok(())
    }

    /// Move a job to `status`. Refused once the job is terminal.
    async fn transition(&self, handle: &JobHandle, status: JobStatus) -> bool {
        let round = {
            let mut record = handle.lock();
            if record.status.is_terminal() {
                return false;
            }
            if let JobStatus::Running { round, .. } = status {
                record.current_round = round;
            }
            record.status = status.clone();
            handle.status_tx.send_replace(status.clone());
            record.current_round
        };
        debug!(job = %handle.job_id, status = %status, "job transition");
        if let Err(e) = self
            .journal
            .record_transition(handle.job_id, &status, round, unix_now())
            .await
        {
            error!(job = %handle.job_id, error = %e, "failed to journal transition");
        }
        true
    }

    fn release_participants(&self, handle: &JobHandle) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        for id in &handle.participants {
            let training = registry
                .get(id)
                .map(|p| p.status == ParticipantStatus::Training)
                .unwrap_or(false);
            if training {
                if let Err(e) = registry.update_status(id, ParticipantStatus::Available) {
                    debug!(job = %handle.job_id, participant = %id, error = %e, "could not release participant");
                }
            }
        }
    }

    async fn start_job(self: Arc<Self>, config: JobConfig) -> OrchestratorResult<JobId> {
        config.validate().map_err(OrchestratorError::InvalidConfig)?;
        let guard: Arc<dyn PrivacyGuard> = if config.privacy.require_proof {
            self.proof_guard.clone().ok_or_else(|| {
                OrchestratorError::InvalidConfig(
                    "require_proof is set but no proof guard is configured".into(),
                )
            })?
        } else {
            Arc::new(NoopGuard)
        };

        let selected = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            let candidates = registry.list_available(&config.selection.filter());
            let selected = config.selection.select(candidates).map_err(|shortfall| {
                OrchestratorError::InsufficientParticipants {
                    required: shortfall.required,
                    available: shortfall.available,
                }
            })?;
            for p in &selected {
                if let Err(e) = registry.update_status(&p.id, ParticipantStatus::Training) {
                    debug!(participant = %p.id, error = %e, "could not mark participant training");
                }
            }
            selected
        };

        let job_id = JobId::new();
        let kind = select_adapter(&selected);
        let Some(adapter) = self.adapters.get(&kind).cloned() else {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            for p in &selected {
                if let Err(e) = registry.update_status(&p.id, ParticipantStatus::Available) {
                    debug!(participant = %p.id, error = %e, "could not release participant");
                }
            }
            return Err(OrchestratorError::InvalidConfig(format!(
                "no {} adapter configured",
                kind
            )));
        };
        let participants: Vec<ParticipantId> = selected.into_iter().map(|p| p.id).collect();
        let handle = Arc::new(JobHandle::new(
            job_id,
            config.clone(),
            kind,
            adapter,
            participants.clone(),
            guard,
        ));

        if let Err(e) = self
            .journal
            .append(JournalEntry::JobCreated {
                job_id,
                config: config.clone(),
                participants: participants.clone(),
                adapter: kind,
                created_at: unix_now(),
            })
            .await
        {
            self.release_participants(&handle);
            return Err(e.into());
        }

        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, Arc::clone(&handle));
        self.transition(&handle, JobStatus::Initializing).await;

        if let Err(e) = self.budgets.initialize(job_id, config.privacy.epsilon) {
            self.transition(
                &handle,
                JobStatus::Failed {
                    reason: FailureReason::PrivacyBudgetExhausted,
                },
            )
            .await;
            self.release_participants(&handle);
            return Err(e.into());
        }
        if let Ok(state) = self.budgets.state(job_id) {
            self.append_journal(JournalEntry::Budget { state }).await;
        }

        info!(
            job = %job_id,
            adapter = %kind,
            participants = participants.len(),
            quorum = config.quorum(),
            "training job started"
        );
        self.emit(LifecycleEvent::TrainingStarted {
            job_id,
            participants,
            adapter: kind,
        });

        let runner = Arc::clone(&self);
        tokio::spawn(async move {
            runner.run_job(handle).await;
        });
        Ok(job_id)
    }

    async fn stop_job(&self, job_id: JobId) -> OrchestratorResult<JobStatus> {
        let handle = self.handle(job_id)?;
        if !self.transition(&handle, JobStatus::Cancelled).await {
            return Ok(handle.status());
        }
        handle.cancel_tx.send_replace(true);
        handle.adapter.stop_job(&job_id);
        self.release_participants(&handle);

        let round = handle.lock().current_round;
        info!(job = %job_id, round, "training job cancelled");
        self.emit(LifecycleEvent::TrainingCancelled { job_id, round });

        if let Some(hub) = self.hub.clone() {
            let targets: Vec<_> = handle
                .participants
                .iter()
                .filter(|p| hub.is_connected(p))
                .cloned()
                .collect();
            if !targets.is_empty() {
                tokio::spawn(async move {
                    for (participant, e) in hub.broadcast(&targets, &Frame::Cancel { job_id }).await {
                        debug!(job = %job_id, participant = %participant, error = %e, "cancel notice not delivered");
                    }
                });
            }
        }
        Ok(JobStatus::Cancelled)
    }

    async fn submit_update(&self, update: ModelUpdate) -> OrchestratorResult<Admission> {
        let handle = self.handle(update.job_id)?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(OrchestratorError::JobNotActive {
                job_id: update.job_id,
                status,
            });
        }

        let admission = match handle.adapter.collect_update(&update) {
            Ok(admission) => admission,
            Err(e) => {
                if let Some((participant, threat)) = e.threat() {
                    warn!(job = %update.job_id, participant = %participant, error = %e, "rejected update");
                    self.emit(LifecycleEvent::SecurityThreatDetected {
                        job_id: Some(update.job_id),
                        round: Some(update.round),
                        participant,
                        threat,
                    });
                } else {
                    debug!(job = %update.job_id, participant = %update.participant_id, error = %e, "update not accepted");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self.journal.record_update(&admission.record).await {
            error!(job = %update.job_id, error = %e, "failed to journal update");
        }
        if matches!(handle.config.privacy.mechanism, PrivacyMechanism::PerUpdate { .. }) {
            if let Ok(state) = self.budgets.state(update.job_id) {
                self.append_journal(JournalEntry::Budget { state }).await;
            }
        }
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = registry.heartbeat(&update.participant_id) {
                debug!(job = %update.job_id, participant = %update.participant_id, error = %e, "update from unregistered participant");
            }
        }
        Ok(admission)
    }

    async fn run_job(self: Arc<Self>, handle: Arc<JobHandle>) {
        let outcome = self.drive(&handle).await;
        handle.adapter.stop_job(&handle.job_id);

        let (status, event) = {
            let record = handle.lock();
            let rounds_completed = record.rounds_completed;
            match outcome {
                JobOutcome::Completed { converged } => (
                    JobStatus::Completed { converged },
                    LifecycleEvent::TrainingCompleted {
                        job_id: handle.job_id,
                        rounds_completed,
                        converged,
                    },
                ),
                JobOutcome::Failed(reason) => (
                    JobStatus::Failed { reason },
                    LifecycleEvent::TrainingFailed {
                        job_id: handle.job_id,
                        reason,
                        rounds_completed,
                    },
                ),
                JobOutcome::Cancelled => (
                    JobStatus::Cancelled,
                    LifecycleEvent::TrainingCancelled {
                        job_id: handle.job_id,
                        round: record.current_round,
                    },
                ),
            }
        };

        if self.transition(&handle, status.clone()).await {
            match &status {
                JobStatus::Failed { reason } => {
                    warn!(job = %handle.job_id, reason = %reason, "training job failed")
                }
                _ => info!(job = %handle.job_id, status = %status, "training job finished"),
            }
            self.emit(event);
        }
        self.release_participants(&handle);
    }

    async fn drive(&self, handle: &JobHandle) -> JobOutcome {
        let config = &handle.config;
        let mut cancel = handle.cancel_tx.subscribe();
        let mut round: Round = 1;

        loop {
            let stop = *cancel.borrow();
            if stop {
                return JobOutcome::Cancelled;
            }

            if let PrivacyMechanism::PerRound { cost } = config.privacy.mechanism {
                match self.budgets.try_consume(handle.job_id, cost) {
                    Ok(Consumption::Accepted { remaining }) => {
                        debug!(job = %handle.job_id, round, remaining, "round budget charged");
                        if let Ok(state) = self.budgets.state(handle.job_id) {
                            self.append_journal(JournalEntry::Budget { state }).await;
                        }
                    }
                    Ok(Consumption::Rejected { requested, remaining }) => {
                        warn!(job = %handle.job_id, round, requested, remaining, "privacy budget exhausted");
                        return JobOutcome::Failed(FailureReason::PrivacyBudgetExhausted);
                    }
                    Err(e) => {
                        error!(job = %handle.job_id, error = %e, "privacy budget unavailable");
                        return JobOutcome::Failed(FailureReason::PrivacyBudgetExhausted);
                    }
                }
            }

            let mut carried = Vec::new();
            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                match self.run_round(handle, round, carried, &mut cancel).await {
                    RoundOutcome::Aggregated(result) => break result,
                    RoundOutcome::Retry(kept) if attempt < 2 => {
                        info!(job = %handle.job_id, round, carried = kept.len(), "retrying round");
                        carried = kept;
                    }
                    RoundOutcome::Retry(_) => {
                        return JobOutcome::Failed(FailureReason::InsufficientQuorum)
                    }
                    RoundOutcome::Fatal(reason) => return JobOutcome::Failed(reason),
                    RoundOutcome::Cancelled => return JobOutcome::Cancelled,
                }
            };

            let completed = match self.commit_round(handle, &result) {
                Ok(completed) => completed,
                Err(CommitRefused::Terminal) => return JobOutcome::Cancelled,
                Err(CommitRefused::AlreadyStored) => {
                    error!(job = %handle.job_id, round, "round result already stored");
                    return JobOutcome::Failed(FailureReason::AggregationError);
                }
            };
            if let Err(e) = self.journal.record_result(&result).await {
                error!(job = %handle.job_id, round, error = %e, "failed to journal result");
            }
            info!(
                job = %handle.job_id,
                round,
                participating = result.participating.len(),
                excluded = result.excluded.len(),
                loss_delta = result.metrics.loss_delta,
                "round aggregated"
            );
            self.emit(LifecycleEvent::RoundCompleted {
                job_id: handle.job_id,
                round,
                participating: result.participating.len(),
                excluded: result.excluded.clone(),
                metrics: result.metrics.clone(),
            });

            match config
                .convergence
                .evaluate(completed, config.target_rounds, &result.metrics)
            {
                Verdict::Continue => round += 1,
                Verdict::Converged => return JobOutcome::Completed { converged: true },
                Verdict::TargetReached => return JobOutcome::Completed { converged: false },
            }
        }
    }

    async fn run_round(
        &self,
        handle: &JobHandle,
        round: Round,
        carried: Vec<ResolvedUpdate>,
        cancel: &mut watch::Receiver<bool>,
    ) -> RoundOutcome {
        let config = &handle.config;
        let quorum = handle.quorum();
        let (global_model, previous_model, baseline_loss) = {
            let record = handle.lock();
            (
                Arc::clone(&record.global_model),
                record.previous_model.clone(),
                record.baseline_loss,
            )
        };
        let charge = match config.privacy.mechanism {
            PrivacyMechanism::PerUpdate { cost } => Some(UpdateCharge {
                tracker: Arc::clone(&self.budgets),
                cost,
            }),
            PrivacyMechanism::PerRound { .. } => None,
        };

        let spec = RoundSpec {
            job_id: handle.job_id,
            round,
            global_model: Arc::clone(&global_model),
            previous_model,
            participants: handle.participants.clone(),
            quorum,
            base_timeout: config.round_timeout.unwrap_or(self.settings.round_timeout),
            guard: Arc::clone(&handle.guard),
            charge,
            carried,
        };
        let dispatch = match handle.adapter.start_round(spec) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                error!(job = %handle.job_id, round, error = %e, "adapter could not open round");
                return RoundOutcome::Fatal(FailureReason::AdapterFailure);
            }
        };

        let collecting = JobStatus::Running {
            round,
            phase: RoundPhase::Collecting,
        };
        if !self.transition(handle, collecting).await {
            return RoundOutcome::Cancelled;
        }

        if let Some(hub) = &self.hub {
            let connected: Vec<_> = dispatch
                .recipients
                .iter()
                .filter(|p| hub.is_connected(p))
                .cloned()
                .collect();
            if !connected.is_empty() {
                let failures = hub.broadcast(&connected, &Frame::Task(dispatch.task.clone())).await;
                for (participant, e) in &failures {
                    warn!(job = %handle.job_id, round, participant = %participant, error = %e, "task dispatch failed");
                }
                if failures.len() * 2 > handle.participants.len() {
                    error!(
                        job = %handle.job_id,
                        round,
                        failed = failures.len(),
                        total = handle.participants.len(),
                        "dispatch failed for most participants"
                    );
                    return RoundOutcome::Fatal(FailureReason::AdapterFailure);
                }
            }
            debug!(
                job = %handle.job_id,
                round,
                dispatched = connected.len(),
                out_of_band = dispatch.recipients.len() - connected.len(),
                "round dispatched"
            );
        }

        let trigger = tokio::select! {
            trigger = dispatch.collector.wait_for_trigger(dispatch.timeout) => trigger,
            _ = cancelled(cancel) => return RoundOutcome::Cancelled,
        };
        let Some(harvest) = dispatch.collector.begin_aggregation() else {
            error!(job = %handle.job_id, round, "round already claimed");
            return RoundOutcome::Fatal(FailureReason::AggregationError);
        };
        if harvest.budget_exhausted || trigger == Trigger::BudgetExhausted {
            warn!(job = %handle.job_id, round, "privacy budget exhausted during collection");
            return RoundOutcome::Fatal(FailureReason::PrivacyBudgetExhausted);
        }
        if harvest.updates.len() < quorum {
            warn!(
                job = %handle.job_id,
                round,
                received = harvest.updates.len(),
                quorum,
                "round timed out below quorum"
            );
            return RoundOutcome::Retry(harvest.updates);
        }

        let aggregating = JobStatus::Running {
            round,
            phase: RoundPhase::Aggregating,
        };
        if !self.transition(handle, aggregating).await {
            return RoundOutcome::Cancelled;
        }

        let algorithm = config
            .aggregation
            .algorithm
            .unwrap_or_else(|| handle.adapter.default_algorithm());
        let baseline = RoundBaseline {
            parameters: global_model.as_ref().clone(),
            mean_loss: baseline_loss,
        };
        match RobustAggregator::new().aggregate(
            handle.job_id,
            round,
            &harvest.updates,
            algorithm,
            config.aggregation.fault_tolerance,
            &baseline,
        ) {
            Ok(result) => {
                self.report_faulty(handle.job_id, round, &result.excluded);
                if result.participating.len() < quorum {
                    warn!(
                        job = %handle.job_id,
                        round,
                        participating = result.participating.len(),
                        quorum,
                        "quorum lost after exclusion"
                    );
                    let kept = harvest
                        .updates
                        .into_iter()
                        .filter(|u| result.participating.contains(&u.participant_id))
                        .collect();
                    return RoundOutcome::Retry(kept);
                }
                RoundOutcome::Aggregated(result)
            }
            Err(AggregationError::AllExcluded { excluded }) => {
                self.report_faulty(handle.job_id, round, &excluded);
                RoundOutcome::Fatal(FailureReason::AllUpdatesFaulty)
            }
            Err(e) => {
                error!(job = %handle.job_id, round, error = %e, "aggregation failed");
                RoundOutcome::Fatal(FailureReason::AggregationError)
            }
        }
    }

    fn report_faulty(&self, job_id: JobId, round: Round, excluded: &[ParticipantId]) {
        for participant in excluded {
            warn!(job = %job_id, round, participant = %participant, "update excluded as faulty");
            self.emit(LifecycleEvent::SecurityThreatDetected {
                job_id: Some(job_id),
                round: Some(round),
                participant: participant.clone(),
                threat: ThreatKind::FaultyUpdate,
            });
        }
    }

    /// Store a round's result and return the completed-round count.
    fn commit_round(
        &self,
        handle: &JobHandle,
        result: &AggregationResult,
    ) -> Result<u32, CommitRefused> {
        let mut record = handle.lock();
        if record.status.is_terminal() {
            return Err(CommitRefused::Terminal);
        }
        if record.results.iter().any(|r| r.round == result.round) {
            return Err(CommitRefused::AlreadyStored);
        }
        let previous = std::mem::replace(
            &mut record.global_model,
            Arc::new(result.aggregated_parameters.clone()),
        );
        record.previous_model = Some(previous);
        if result.metrics.mean_loss.is_some() {
            record.baseline_loss = result.metrics.mean_loss;
        }
        record.rounds_completed += 1;
        record.results.push(result.clone());
        Ok(record.rounds_completed)
    }

    async fn handle_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { participant, frame } => match frame {
                Frame::Hello(announced) => {
                    if announced.id != participant {
                        self.report_impersonation(&participant, announced.id);
                        return;
                    }
                    match self.register_participant(announced).await {
                        Ok(()) => {}
                        Err(OrchestratorError::Registry(RegistryError::Duplicate(_))) => {
                            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                            if let Err(e) = registry.heartbeat(&participant) {
                                debug!(participant = %participant, error = %e, "heartbeat on re-announce failed");
                            }
                        }
                        Err(e) => warn!(participant = %participant, error = %e, "registration over channel rejected"),
                    }
                }
                Frame::Update(update) => {
                    if update.participant_id != participant {
                        self.report_impersonation(&participant, update.participant_id);
                        return;
                    }
                    if let Err(e) = self.submit_update(update).await {
                        debug!(participant = %participant, error = %e, "channel update not accepted");
                    }
                }
                Frame::Heartbeat { .. } => {
                    let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = registry.heartbeat(&participant) {
                        debug!(participant = %participant, error = %e, "heartbeat from unknown participant");
                    }
                }
                other => {
                    warn!(participant = %participant, kind = other.kind(), "unexpected frame from participant");
                }
            },
            TransportEvent::Disconnected { participant, reason } => {
                let marked = {
                    let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
                    registry
                        .update_status(&participant, ParticipantStatus::Offline)
                        .is_ok()
                };
                info!(participant = %participant, reason = ?reason, "participant disconnected");
                if marked {
                    self.emit(LifecycleEvent::ParticipantOffline { participant });
                }
            }
        }
    }

    fn report_impersonation(&self, channel: &ParticipantId, claimed: ParticipantId) {
        warn!(participant = %channel, claimed = %claimed, "frame claims another participant");
        self.emit(LifecycleEvent::SecurityThreatDetected {
            job_id: None,
            round: None,
            participant: channel.clone(),
            threat: ThreatKind::Impersonation { claimed },
        });
    }

    fn sweep(&self) {
        let offline = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.sweep_stale(Instant::now(), self.settings.heartbeat_timeout)
        };
        for participant in offline {
            info!(participant = %participant, "participant marked offline");
            self.emit(LifecycleEvent::ParticipantOffline { participant });
        }
    }

    async fn recover(&self) -> OrchestratorResult<RecoveryReport> {
        let entries = self.journal.replay().await?;
        let mut report = RecoveryReport::default();
        let mut participants = BTreeMap::new();
        let mut handles: BTreeMap<JobId, Arc<JobHandle>> = BTreeMap::new();

        for entry in entries {
            match entry {
                JournalEntry::ParticipantRegistered { participant } => {
                    participants.insert(participant.id.clone(), participant);
                }
                JournalEntry::JobCreated {
                    job_id,
                    config,
                    participants,
                    adapter,
                    ..
                } => {
                    let Some(implementation) = self.adapters.get(&adapter) else {
                        warn!(job = %job_id, adapter = %adapter, "no adapter for journaled job");
                        continue;
                    };
                    handles.insert(
                        job_id,
                        Arc::new(JobHandle::new(
                            job_id,
                            config,
                            adapter,
                            Arc::clone(implementation),
                            participants,
                            Arc::new(NoopGuard),
                        )),
                    );
                }
                JournalEntry::Transition {
                    job_id,
                    status,
                    round,
                    ..
                } => {
                    if let Some(handle) = handles.get(&job_id) {
                        let mut record = handle.lock();
                        record.current_round = round;
                        record.status = status;
                    }
                }
                JournalEntry::RoundAggregated { result } => {
                    if let Some(handle) = handles.get(&result.job_id) {
                        let mut record = handle.lock();
                        let previous = std::mem::replace(
                            &mut record.global_model,
                            Arc::new(result.aggregated_parameters.clone()),
                        );
                        record.previous_model = Some(previous);
                        if result.metrics.mean_loss.is_some() {
                            record.baseline_loss = result.metrics.mean_loss;
                        }
                        record.rounds_completed += 1;
                        record.results.push(result);
                        report.results += 1;
                    }
                }
                JournalEntry::Budget { state } => self.budgets.restore(state),
                JournalEntry::UpdateAccepted { .. } => report.updates += 1,
            }
        }

        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            for (_, mut participant) in participants {
                participant.status = ParticipantStatus::Offline;
                registry.restore(participant);
                report.participants += 1;
            }
        }

        for (job_id, handle) in handles {
            {
                let record = handle.lock();
                handle.status_tx.send_replace(record.status.clone());
            }
            let inserted = {
                let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
                if jobs.contains_key(&job_id) {
                    false
                } else {
                    jobs.insert(job_id, Arc::clone(&handle));
                    true
                }
            };
            if !inserted {
                continue;
            }
            report.jobs += 1;

            let interrupted = JobStatus::Failed {
                reason: FailureReason::Interrupted,
            };
            if self.transition(&handle, interrupted).await {
                let rounds_completed = handle.lock().rounds_completed;
                warn!(job = %job_id, rounds_completed, "job interrupted by restart");
                self.emit(LifecycleEvent::TrainingFailed {
                    job_id,
                    reason: FailureReason::Interrupted,
                    rounds_completed,
                });
                report.interrupted.push(job_id);
            }
        }

        info!(
            participants = report.participants,
            jobs = report.jobs,
            interrupted = report.interrupted.len(),
            "recovered from journal"
        );
        Ok(report)
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn pump_transport(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_transport(event).await;
    }
    debug!("transport event stream ended");
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}
