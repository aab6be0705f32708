//! Cohort configuration file handling
//!
//! Operator settings only: how the orchestrator process runs (timeouts,
//! listen address, journal location, logging). Per-job settings such as
//! selection, aggregation and privacy live in job TOML files and are checked
//! with `cohort validate-job`.

use cohort::orchestrator::OrchestratorSettings;
use cohort::registry::DEFAULT_REGISTRY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_LISTEN: &str = "127.0.0.1:7878";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    pub transport: TransportConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Durations are humantime strings ("30s", "1m 30s").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_round_timeout", with = "cohort::serialization::duration")]
    pub round_timeout: Duration,

    #[serde(default = "default_heartbeat_timeout", with = "cohort::serialization::duration")]
    pub heartbeat_timeout: Duration,

    /// "0s" disables the liveness sweep
    #[serde(default = "default_sweep_interval", with = "cohort::serialization::duration")]
    pub sweep_interval: Duration,

    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Hex-encoded master secret; every channel key is derived from it
    pub master_secret: String,

    /// LZ4-compress sealed frames
    #[serde(default = "default_true")]
    pub lz4: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    /// Journal file (in-memory only if not specified)
    pub journal: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_round_timeout() -> Duration {
    OrchestratorSettings::default().round_timeout
}

fn default_heartbeat_timeout() -> Duration {
    OrchestratorSettings::default().heartbeat_timeout
}

fn default_sweep_interval() -> Duration {
    OrchestratorSettings::default().sweep_interval
}

fn default_registry_capacity() -> usize {
    DEFAULT_REGISTRY_CAPACITY
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            round_timeout: default_round_timeout(),
            heartbeat_timeout: default_heartbeat_timeout(),
            sweep_interval: default_sweep_interval(),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            round_timeout: self.round_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            sweep_interval: self.sweep_interval,
            registry_capacity: self.registry_capacity,
        }
    }
}

impl CohortConfig {
    /// Create a new configuration around the given master secret
    pub fn new(master_secret: String) -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            transport: TransportConfig {
                listen: default_listen(),
                master_secret,
                lz4: true,
            },
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: CohortConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(master_secret: &str, journal_path: &Path) -> String {
        format!(
            r#"# Cohort Orchestrator Configuration (Operator Settings)
#
# Job parameters (selection, aggregation, privacy budget) are NOT set here;
# they belong in per-job TOML files passed to `cohort run --job`.

[orchestrator]
# Base round timeout; device jobs double it
round_timeout = "30s"

# Participants silent for longer than this are marked offline
heartbeat_timeout = "1m 30s"

# How often to sweep for silent participants ("0s" disables)
sweep_interval = "15s"

registry_capacity = {capacity}

[transport]
listen = "{listen}"

# Master secret (hex). Participant channel keys are derived from it.
# Keep this file private.
master_secret = "{master_secret}"

# LZ4-compress sealed frames
lz4 = true

[persistence]
# Journal used to recover participants, jobs and budgets after a restart
journal = "{journal}"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/cohort/cohort.log"
"#,
            capacity = DEFAULT_REGISTRY_CAPACITY,
            listen = DEFAULT_LISTEN,
            master_secret = master_secret,
            journal = journal_path.display()
        )
    }

    /// Create and save a default configuration file with a fresh secret
    pub fn create_default(
        config_path: &Path,
        journal_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let secret = cohort::crypto::ChannelKeyring::generate_secret_hex();
        let contents = Self::generate_default_toml(&secret, journal_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, contents).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }
}

/// Data directory for config and journal: ~/.local/share/cohort/
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cohort")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Journal file adjacent to the config
pub fn default_journal_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or(config_path)
        .join("journal.cbor")
}
