//! Integration tests for restart recovery from the on-disk journal.
//!
//! - Orchestrator journals registrations, transitions, results and budgets
//! - A fresh orchestrator over the same file rebuilds that state
//! - Jobs that were mid-flight come back as failed (interrupted)

use cohort::identity::{Principal, Role};
use cohort::model::{ModelUpdate, ParticipantId, UpdatePayload};
use cohort::orchestrator::{
    FailureReason, JobConfig, JobStatus, Orchestrator, OrchestratorError, OrchestratorSettings,
};
use cohort::persistence::{FileJournal, JournalEntry, JournalStore};
use cohort::registry::{Capability, ComputeTier, Participant, ParticipantClass, ParticipantStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn device(id: &str) -> Participant {
    Participant::new(
        id,
        ParticipantClass::Device,
        Capability {
            compute_tier: ComputeTier::Medium,
            memory_mb: 4096,
            bandwidth_mbps: 20.0,
            sample_count: 200,
            data_quality: 0.9,
        },
    )
}

async fn orchestrator_on(journal: Arc<FileJournal>) -> Orchestrator {
    Orchestrator::builder()
        .settings(OrchestratorSettings {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        })
        .journal(journal)
        .build()
}

#[tokio::test(flavor = "current_thread")]
async fn test_restart_restores_state_and_interrupts_running_jobs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.cbor");
    let operator = Principal::operator("ops");

    let (finished, running) = {
        let orchestrator = orchestrator_on(Arc::new(FileJournal::open(&path).await.unwrap())).await;
        for id in ["a", "b", "c"] {
            orchestrator.register_participant(device(id)).await.unwrap();
        }

        // One job that completes
        let mut config = JobConfig::new(1, vec![0.0, 0.0]);
        config.selection.max_participants = 3;
        config.aggregation.quorum = Some(3);
        let finished = orchestrator.start_job(&operator, config).await.unwrap();
        let mut status = orchestrator.watch_job(finished).unwrap();
        status.wait_for(|s| s.is_collecting()).await.unwrap();
        for id in ["a", "b", "c"] {
            orchestrator
                .submit_update(ModelUpdate {
                    job_id: finished,
                    participant_id: ParticipantId::new(id),
                    round: 1,
                    payload: UpdatePayload::Dense(vec![2.0, 4.0]),
                    sample_count: 50,
                    training_loss: Some(0.5),
                    privacy_proof: None,
                })
                .await
                .unwrap();
        }
        assert!(matches!(
            orchestrator.wait_for_completion(finished).await.unwrap(),
            JobStatus::Completed { .. }
        ));

        // One job left collecting when the process "dies"
        let mut config = JobConfig::new(5, vec![0.0, 0.0]);
        config.round_timeout = Some(Duration::from_secs(600));
        let running = orchestrator.start_job(&operator, config).await.unwrap();
        let mut status = orchestrator.watch_job(running).unwrap();
        status.wait_for(|s| s.is_collecting()).await.unwrap();

        orchestrator.shutdown().await;
        (finished, running)
    };

    let restarted = orchestrator_on(Arc::new(FileJournal::open(&path).await.unwrap())).await;
    let report = restarted.recover(&operator).await.unwrap();

    assert_eq!(report.participants, 3);
    assert_eq!(report.jobs, 2);
    assert_eq!(report.interrupted, vec![running]);
    assert_eq!(report.results, 1);
    assert_eq!(report.updates, 3);

    assert!(matches!(
        restarted.job(finished).unwrap().status,
        JobStatus::Completed { .. }
    ));
    assert_eq!(
        restarted.job(running).unwrap().status,
        JobStatus::Failed {
            reason: FailureReason::Interrupted
        }
    );
    assert_eq!(restarted.global_model(finished).unwrap(), vec![2.0, 4.0]);
    assert_eq!(restarted.results(finished).unwrap().len(), 1);

    // Default mechanism charges 0.1 per round against epsilon 10
    let remaining = restarted.remaining_epsilon(finished).unwrap();
    assert!((remaining - 9.9).abs() < 1e-9);

    // Participants come back offline until they reconnect
    for participant in restarted.participants() {
        assert_eq!(participant.status, ParticipantStatus::Offline);
    }
    restarted.heartbeat(&ParticipantId::new("a")).unwrap();
    assert_eq!(
        restarted.participant(&ParticipantId::new("a")).unwrap().status,
        ParticipantStatus::Available
    );
}

#[tokio::test]
async fn test_recover_requires_operator_role() {
    let dir = TempDir::new().unwrap();
    let journal = Arc::new(FileJournal::open(dir.path().join("journal.cbor")).await.unwrap());
    let orchestrator = orchestrator_on(journal).await;

    let err = orchestrator
        .recover(&Principal::new("viewer", Role::Viewer))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Unauthorized(_)));
}

#[tokio::test]
async fn test_torn_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.cbor");

    {
        let journal = FileJournal::open(&path).await.unwrap();
        journal
            .record_participant(&device("a"))
            .await
            .unwrap();
    }
    // Simulate a crash mid-append: a length prefix with no body
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0, 0, 1, 0]).unwrap();
    }

    let journal = FileJournal::open(&path).await.unwrap();
    let entries = journal.replay().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0], JournalEntry::ParticipantRegistered { .. }));
}
