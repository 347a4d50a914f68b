//! Orchestrator configuration
//!
//! Process-level settings: where to listen, how many workers to run, and
//! where the policy and adapter definitions live. Rules of Engagement are not
//! configured here; they come from the policy file.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (e.g., "0.0.0.0:8080")
    pub bind_addr: String,

    /// Number of executor workers
    pub workers: usize,

    /// YAML policy file; the built-in default policy is used when unset
    pub policy_file: Option<PathBuf>,

    /// YAML file declaring external-process tool adapters
    pub adapters_file: Option<PathBuf>,

    /// Base directory handed to adapters for tool output files
    pub output_dir: PathBuf,

    /// How often the scheduler re-checks its table when idle
    pub scheduler_tick: Duration,

    /// Attempts made for each persistence write before giving up
    pub persist_attempts: u32,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(bind_addr: String) -> Self {
        Self {
            bind_addr,
            workers: 4,
            policy_file: None,
            adapters_file: None,
            output_dir: std::env::temp_dir().join("recon"),
            scheduler_tick: Duration::from_secs(30),
            persist_attempts: 5,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - RECON_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - RECON_WORKERS (optional, default: 4)
    /// - RECON_POLICY_FILE (optional)
    /// - RECON_ADAPTERS_FILE (optional)
    /// - RECON_OUTPUT_DIR (optional, default: $TMPDIR/recon)
    /// - RECON_SCHEDULER_TICK (optional, seconds, default: 30)
    /// - RECON_PERSIST_RETRIES (optional, default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("RECON_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let mut config = Self::new(bind_addr);

        if let Ok(raw) = std::env::var("RECON_WORKERS") {
            config.workers = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("RECON_WORKERS must be a positive integer"))?;
        }

        config.policy_file = std::env::var("RECON_POLICY_FILE").ok().map(PathBuf::from);
        config.adapters_file = std::env::var("RECON_ADAPTERS_FILE").ok().map(PathBuf::from);

        if let Ok(dir) = std::env::var("RECON_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }

        config.scheduler_tick = std::env::var("RECON_SCHEDULER_TICK")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.scheduler_tick);

        config.persist_attempts = std::env::var("RECON_PERSIST_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.persist_attempts);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.scheduler_tick.is_zero() {
            anyhow::bail!("scheduler_tick must be greater than 0");
        }

        if self.persist_attempts == 0 {
            anyhow::bail!("persist_attempts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("0.0.0.0:8080".to_string())
    }
}
