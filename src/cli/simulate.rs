use super::validate::load_job;
use cohort::events::TracingSink;
use cohort::simulation::{run_simulation, SimulationConfig};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Options collected from `cohort simulate`.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub devices: usize,
    pub organizations: usize,
    pub faulty: usize,
    pub silent: usize,
    pub dimension: usize,
    pub rounds: u32,
    pub seed: u64,
    pub job: Option<String>,
    pub lz4: bool,
}

impl SimulateOptions {
    fn config(&self) -> SimulationConfig {
        SimulationConfig {
            devices: self.devices,
            organizations: self.organizations,
            faulty: self.faulty,
            silent: self.silent,
            dimension: self.dimension,
            seed: self.seed,
            lz4: self.lz4,
            ..Default::default()
        }
    }
}

/// Run a job against in-process participants and print the report as JSON.
///
/// Logs go to stderr (quiet unless RUST_LOG is set) so stdout stays
/// machine-readable.
pub async fn execute(options: SimulateOptions) -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let config = options.config();
    let job = match &options.job {
        Some(path) => load_job(Path::new(path))?,
        None => {
            let mut job = config.default_job();
            job.target_rounds = options.rounds;
            job
        }
    };
    if job.initial_parameters.len() != config.dimension {
        return Err(format!(
            "job has {} parameters but the simulation dimension is {}",
            job.initial_parameters.len(),
            config.dimension
        )
        .into());
    }

    let report = run_simulation(&config, job, Arc::new(TracingSink)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimulateOptions {
        SimulateOptions {
            devices: 3,
            organizations: 0,
            faulty: 0,
            silent: 0,
            dimension: 4,
            rounds: 2,
            seed: 11,
            job: None,
            lz4: true,
        }
    }

    #[test]
    fn test_options_map_to_config() {
        let config = options().config();
        assert_eq!(config.devices, 3);
        assert_eq!(config.dimension, 4);
        assert_eq!(config.seed, 11);
    }

    #[tokio::test]
    async fn test_simulate_runs_to_completion() {
        execute(options()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("job.toml");
        std::fs::write(&path, "target_rounds = 2\ninitial_parameters = [0.0, 0.0]\n").unwrap();

        let mut opts = options();
        opts.job = Some(path.to_string_lossy().to_string());
        assert!(execute(opts).await.is_err());
    }
}
