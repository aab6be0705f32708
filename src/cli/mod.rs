use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod simulate;
pub mod validate;
pub mod version;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Federated training orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator: recover from the journal, accept participant
    /// connections over TCP, optionally start a job
    Run {
        /// Path to configuration file (default: ~/.local/share/cohort/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Job TOML to start once enough participants have connected
        #[arg(long)]
        job: Option<String>,
    },

    /// Train against in-process participants and print the results as JSON
    Simulate {
        /// Number of simulated edge devices
        #[arg(long, default_value_t = 5)]
        devices: usize,

        /// Number of simulated organizations
        #[arg(long, default_value_t = 0)]
        organizations: usize,

        /// Participants that report corrupted parameters
        #[arg(long, default_value_t = 0)]
        faulty: usize,

        /// Participants that never report
        #[arg(long, default_value_t = 0)]
        silent: usize,

        /// Model dimension
        #[arg(long, default_value_t = 16)]
        dimension: usize,

        /// Target rounds (ignored when --job is given)
        #[arg(long, default_value_t = 10)]
        rounds: u32,

        #[arg(long, default_value_t = 7)]
        seed: u64,

        /// Job TOML to run instead of the generated one
        #[arg(long)]
        job: Option<String>,

        /// Disable LZ4 frame compression
        #[arg(long)]
        no_lz4: bool,
    },

    /// Parse and validate a job TOML file
    ValidateJob {
        /// Path to the job file
        file: String,
    },

    /// Write a default configuration with a fresh master secret
    InitConfig {
        /// Where to write (default: ~/.local/share/cohort/config.toml)
        #[arg(long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { config, job } => run::execute(config, job).await,
        Commands::Simulate {
            devices,
            organizations,
            faulty,
            silent,
            dimension,
            rounds,
            seed,
            job,
            no_lz4,
        } => {
            let options = simulate::SimulateOptions {
                devices,
                organizations,
                faulty,
                silent,
                dimension,
                rounds,
                seed,
                job,
                lz4: !no_lz4,
            };
            simulate::execute(options).await
        }
        Commands::ValidateJob { file } => validate::execute(&file),
        Commands::InitConfig { path, force } => init_config(path, force),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

fn init_config(path: Option<String>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    if config_path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    let journal_path = config::default_journal_path(&config_path);
    config::CohortConfig::create_default(&config_path, &journal_path)?;
    println!("Created: {}", config_path.display());
    Ok(())
}
