use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub finalizer: FinalizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Interval between background refreshes in milliseconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Age after which a snapshot is flagged stale
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,
    /// Age after which a snapshot is refused by the readiness gate
    #[serde(default = "default_not_ready_after")]
    pub not_ready_after_ms: u64,
    /// Bounded wait for the refresh thread on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

fn default_refresh_interval() -> u64 {
    30_000
}

fn default_stale_after() -> u64 {
    60_000
}

fn default_not_ready_after() -> u64 {
    300_000
}

fn default_stop_timeout() -> u64 {
    5_000
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval(),
            stale_after_ms: default_stale_after(),
            not_ready_after_ms: default_not_ready_after(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl InventoryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn not_ready_after(&self) -> Duration {
        Duration::from_millis(self.not_ready_after_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// How a worker reports a job once the ledger accepted it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMode {
    /// Poll until the ledger reports a final status or the job times out
    #[default]
    Blocking,
    /// Report "submitted" immediately and hand the handle to the finalizer
    Provisional,
}

impl std::fmt::Display for SettlementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementMode::Blocking => write!(f, "blocking"),
            SettlementMode::Provisional => write!(f, "provisional"),
        }
    }
}

impl std::str::FromStr for SettlementMode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "blocking" | "sync" => Ok(Self::Blocking),
            "provisional" | "async" => Ok(Self::Provisional),
            other => Err(format!(
                "invalid settlement mode '{other}'; expected blocking|provisional"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Polling interval for job status in milliseconds
    #[serde(default = "default_job_poll_interval")]
    pub poll_interval_ms: u64,
    /// Hard timeout waiting for a final status in milliseconds
    #[serde(default = "default_job_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub settlement: SettlementMode,
    /// Per-worker join timeout on shutdown
    #[serde(default = "default_stop_timeout")]
    pub shutdown_timeout_ms: u64,
    /// How long a consumed job id keeps answering "consumed"
    #[serde(default = "default_consumed_retention")]
    pub consumed_retention_ms: u64,
}

fn default_job_poll_interval() -> u64 {
    250
}

fn default_job_timeout() -> u64 {
    60_000
}

fn default_consumed_retention() -> u64 {
    3_600_000
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_job_poll_interval(),
            timeout_ms: default_job_timeout(),
            settlement: SettlementMode::default(),
            shutdown_timeout_ms: default_stop_timeout(),
            consumed_retention_ms: default_consumed_retention(),
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn consumed_retention(&self) -> Duration {
        Duration::from_millis(self.consumed_retention_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinalizerConfig {
    /// Interval between settlement polls in milliseconds
    #[serde(default = "default_finalizer_poll_interval")]
    pub poll_interval_ms: u64,
    /// Tracked handles older than this are dropped as orphaned, and
    /// settled outcomes nobody took are discarded after the same age
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

fn default_finalizer_poll_interval() -> u64 {
    2_000
}

fn default_settle_timeout() -> u64 {
    600_000
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_finalizer_poll_interval(),
            settle_timeout_ms: default_settle_timeout(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

impl FinalizerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("jobs.settlement", "blocking")?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PRINTLEDGER_ENV")
                        .unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // PRINTLEDGER_JOBS__TIMEOUT_MS, PRINTLEDGER_INVENTORY__REFRESH_INTERVAL_MS, ...
            .add_source(
                Environment::with_prefix("PRINTLEDGER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.inventory.refresh_interval_ms == 0 {
            errors.push("inventory.refresh_interval_ms must be positive".to_string());
        }
        if self.inventory.stale_after_ms == 0 {
            errors.push("inventory.stale_after_ms must be positive".to_string());
        }
        if self.inventory.not_ready_after_ms < self.inventory.stale_after_ms {
            errors.push(
                "inventory.not_ready_after_ms should not be shorter than stale_after_ms"
                    .to_string(),
            );
        }

        if self.jobs.poll_interval_ms == 0 {
            errors.push("jobs.poll_interval_ms must be positive".to_string());
        }
        if self.jobs.timeout_ms == 0 {
            errors.push("jobs.timeout_ms must be positive".to_string());
        }

        if self.finalizer.poll_interval_ms == 0 {
            errors.push("finalizer.poll_interval_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = AppConfig::default();
        assert_eq!(config.inventory.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.inventory.stale_after(), Duration::from_secs(60));
        assert_eq!(config.inventory.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.jobs.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.jobs.timeout(), Duration::from_secs(60));
        assert_eq!(config.jobs.settlement, SettlementMode::Blocking);
        assert_eq!(config.jobs.consumed_retention(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = AppConfig::default();
        config.jobs.timeout_ms = 0;
        config.inventory.refresh_interval_ms = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("timeout_ms")));
        assert!(errors.iter().any(|e| e.contains("refresh_interval_ms")));
    }

    #[test]
    fn test_timeout_shorter_than_poll_interval_is_valid() {
        let mut config = AppConfig::default();
        config.jobs.timeout_ms = 100;
        assert!(config.jobs.timeout() < config.jobs.poll_interval());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settlement_mode_parses_aliases() {
        assert_eq!("async".parse::<SettlementMode>().unwrap(), SettlementMode::Provisional);
        assert_eq!("Blocking".parse::<SettlementMode>().unwrap(), SettlementMode::Blocking);
        assert!("eventually".parse::<SettlementMode>().is_err());
    }

    #[test]
    fn test_load_from_reads_default_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            "[jobs]\ntimeout_ms = 1500\nsettlement = \"provisional\"\n\n[inventory]\nrefresh_interval_ms = 1000"
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.jobs.timeout_ms, 1500);
        assert_eq!(config.jobs.settlement, SettlementMode::Provisional);
        assert_eq!(config.inventory.refresh_interval_ms, 1000);
        // Untouched sections keep their defaults
        assert_eq!(config.jobs.poll_interval_ms, 250);
        assert_eq!(config.finalizer.poll_interval_ms, 2_000);
    }
}
