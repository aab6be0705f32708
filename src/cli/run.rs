use super::config::{default_config_path, default_journal_path, CohortConfig, LoggingConfig};
use super::validate::load_job;
use cohort::crypto::ChannelKeyring;
use cohort::events::TracingSink;
use cohort::identity::Principal;
use cohort::orchestrator::{JobConfig, Orchestrator};
use cohort::persistence::{FileJournal, JournalStore, MemoryJournal};
use cohort::privacy::ProofTokenGuard;
use cohort::registry::ParticipantStatus;
use cohort::transport::{SecureChannel, TcpAcceptor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OPERATOR: &str = "cohort-operator";

/// Run the orchestrator service
///
/// Loads configuration (creating a default one if missing), recovers
/// participants, jobs and budgets from the journal, then accepts sealed
/// participant channels on the configured TCP address until Ctrl-C.
///
/// With `--job`, the job is started once enough participants are available
/// and the process exits after it finishes, printing its results as JSON.
pub async fn execute(
    config_path: Option<String>,
    job_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        CohortConfig::load(&config_path)?
    } else {
        println!("📝 No config file found. Creating default configuration...");
        CohortConfig::create_default(&config_path, &default_journal_path(&config_path))?;
        println!("   Created: {}", config_path.display());
        CohortConfig::load(&config_path)?
    };

    let job = job_path
        .map(|path| load_job(&PathBuf::from(path)))
        .transpose()?;

    init_logging(&config.logging)?;
    info!(config = %config_path.display(), "starting cohort orchestrator");

    let keyring = Arc::new(ChannelKeyring::from_hex(&config.transport.master_secret)?);
    let journal: Arc<dyn JournalStore> = match &config.persistence.journal {
        Some(path) => Arc::new(FileJournal::open(path).await?),
        None => Arc::new(MemoryJournal::new()),
    };

    let orchestrator = Orchestrator::builder()
        .settings(config.orchestrator.settings())
        .journal(journal)
        .event_sink(Arc::new(TracingSink))
        .proof_guard(Arc::new(ProofTokenGuard::new(keyring.proof_secret())))
        .with_transport()
        .build();

    let operator = Principal::operator(OPERATOR);
    let report = orchestrator.recover(&operator).await?;
    info!(
        participants = report.participants,
        jobs = report.jobs,
        interrupted = report.interrupted.len(),
        "recovered from journal"
    );

    let acceptor = TcpAcceptor::bind(config.transport.listen.as_str()).await?;
    info!(addr = %acceptor.local_addr()?, "listening for participants");
    let accept_task = tokio::spawn(accept_loop(
        acceptor,
        orchestrator.clone(),
        keyring,
        config.transport.lz4,
    ));

    let outcome = match job {
        Some(job) => {
            tokio::select! {
                result = run_job(&orchestrator, &operator, job) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    Ok(())
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            Ok(())
        }
    };

    accept_task.abort();
    orchestrator.shutdown().await;
    outcome
}

fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}

async fn accept_loop(
    acceptor: TcpAcceptor,
    orchestrator: Orchestrator,
    keyring: Arc<ChannelKeyring>,
    lz4: bool,
) {
    loop {
        let protocol = match acceptor.accept().await {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = protocol.peer();
        let orchestrator = orchestrator.clone();
        let keyring = keyring.clone();

        // Handshake off the accept path so one slow peer cannot stall others
        tokio::spawn(async move {
            match SecureChannel::accept(Arc::new(protocol), &keyring, lz4).await {
                Ok(channel) => {
                    if let Err(e) = orchestrator.attach_channel(channel) {
                        warn!(peer = %peer, error = %e, "could not attach channel");
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "handshake failed"),
            }
        });
    }
}

async fn run_job(
    orchestrator: &Orchestrator,
    operator: &Principal,
    job: JobConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let required = job.selection.min_participants;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let available = orchestrator
            .participants()
            .iter()
            .filter(|p| p.status == ParticipantStatus::Available)
            .count();
        if available >= required {
            break;
        }
        info!(available, required, "waiting for participants");
    }

    let job_id = orchestrator.start_job(operator, job).await?;
    let status = orchestrator.wait_for_completion(job_id).await?;
    info!(job = %job_id, status = %status, "job finished");

    let summary = serde_json::json!({
        "job_id": job_id,
        "status": status,
        "results": orchestrator.results(job_id)?,
        "final_model": orchestrator.global_model(job_id)?,
        "remaining_epsilon": orchestrator.remaining_epsilon(job_id)?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
