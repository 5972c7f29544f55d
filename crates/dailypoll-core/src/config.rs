use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduler tuning defaults — shared between config and the scheduler crate
// so tests and the composing application agree on them.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_SECS: u64 = 2;
pub const DEFAULT_RETRY_CAP_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_CLAIM_BATCH_SIZE: usize = 10;
pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;
pub const COMPLETED_RETENTION_DAYS: i64 = 7;
pub const FAILED_RETENTION_DAYS: i64 = 30;

/// Top-level config (dailypoll.toml + DAILYPOLL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailypollConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for the job scheduler and its worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often each worker polls the store for due jobs.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Number of concurrent worker tasks.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum jobs claimed per poll.
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    /// Attempts before a job is marked terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on each subsequent failure.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Upper bound on the backoff delay.
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    /// Hard limit on a single handler invocation; overruns count as failures.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            worker_count: DEFAULT_WORKER_COUNT,
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_secs: DEFAULT_RETRY_BASE_SECS,
            retry_cap_secs: DEFAULT_RETRY_CAP_SECS,
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
        }
    }
}

impl DailypollConfig {
    /// Load config from a TOML file with DAILYPOLL_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DailypollConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DAILYPOLL_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dailypoll/dailypoll.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dailypoll/dailypoll.toml", home)
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_claim_batch_size() -> usize {
    DEFAULT_CLAIM_BATCH_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_base_secs() -> u64 {
    DEFAULT_RETRY_BASE_SECS
}

fn default_retry_cap_secs() -> u64 {
    DEFAULT_RETRY_CAP_SECS
}

fn default_handler_timeout_secs() -> u64 {
    DEFAULT_HANDLER_TIMEOUT_SECS
}
