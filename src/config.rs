//! Orchestrator configuration.
//!
//! All knobs the host process can supply: coordination-store key names, pool
//! sizing bounds, loop intervals and the watchdog deadline. Values can be
//! built programmatically or loaded from `DOCFLOW_*` environment variables.

use std::time::Duration;

use thiserror::Error;

use crate::job::JobType;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the orchestration core.
///
/// Defaults mirror the production deployment: one worker absorbs 50 pending
/// jobs, at most 10 workers per pipeline and 20 overall, a 5 minute job
/// deadline checked every 30 seconds.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Coordination store
    /// Redis connection URL.
    pub redis_url: String,
    /// Queue key for conference jobs.
    pub conference_queue: String,
    /// Queue key for emission jobs.
    pub emission_queue: String,
    /// Set key holding the identities of in-flight jobs (the distributed lock).
    pub control_set: String,
    /// Set key holding pending kill signals.
    pub kill_set: String,
    /// Hash key mirroring in-flight jobs for crash-recovery visibility.
    pub inflight_hash: String,
    /// List key receiving stuck-job audit records.
    pub stuck_log: String,
    /// List key carrying result records to the write-back component.
    pub results_queue: String,

    // Pool sizing
    /// Job types the pool keeps alive.
    pub enabled_types: Vec<JobType>,
    /// Pending jobs one worker is assumed to absorb.
    pub batch_size: usize,
    /// Upper bound on workers per job type.
    pub max_workers_per_type: usize,
    /// Upper bound on workers across all job types.
    pub max_total_workers: usize,

    // Loop timing
    /// How often the pool recomputes desired worker counts.
    pub rebalance_interval: Duration,
    /// How often the pool prunes dead workers and drains kill signals.
    pub liveness_interval: Duration,
    /// Maximum wall-clock duration of a single job before it is stuck.
    pub max_job_duration: Duration,
    /// How often the watchdog scans for stuck jobs.
    pub watchdog_check_interval: Duration,
    /// How long a worker blocks waiting for a job before looping.
    pub dequeue_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            conference_queue: "queue:conference".to_string(),
            emission_queue: "queue:emission".to_string(),
            control_set: "control:inflight".to_string(),
            kill_set: "watchdog:kill_signals".to_string(),
            inflight_hash: "watchdog:inflight_jobs".to_string(),
            stuck_log: "watchdog:stuck_jobs".to_string(),
            results_queue: "results:sheet".to_string(),
            enabled_types: vec![JobType::Conference, JobType::Emission],
            batch_size: 50,
            max_workers_per_type: 10,
            max_total_workers: 20,
            rebalance_interval: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(10),
            max_job_duration: Duration::from_secs(300),
            watchdog_check_interval: Duration::from_secs(30),
            dequeue_timeout: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCFLOW_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `DOCFLOW_CONFERENCE_QUEUE` / `DOCFLOW_EMISSION_QUEUE`: queue keys
    /// - `DOCFLOW_CONTROL_SET`: in-flight lock set key
    /// - `DOCFLOW_KILL_SET`: kill-signal set key
    /// - `DOCFLOW_INFLIGHT_HASH`: watchdog mirror hash key
    /// - `DOCFLOW_STUCK_LOG`: stuck-job audit list key
    /// - `DOCFLOW_RESULTS_QUEUE`: result sink list key
    /// - `DOCFLOW_ENABLED_TYPES`: comma-separated list (default: conference,emission)
    /// - `DOCFLOW_BATCH_SIZE`: jobs absorbed per worker (default: 50)
    /// - `DOCFLOW_MAX_WORKERS_PER_TYPE`: per-type worker cap (default: 10)
    /// - `DOCFLOW_MAX_TOTAL_WORKERS`: global worker cap (default: 20)
    /// - `DOCFLOW_REBALANCE_INTERVAL_SECS`: rebalance period (default: 60)
    /// - `DOCFLOW_LIVENESS_INTERVAL_SECS`: liveness scan period (default: 10)
    /// - `DOCFLOW_MAX_JOB_DURATION_SECS`: stuck-job deadline (default: 300)
    /// - `DOCFLOW_WATCHDOG_CHECK_INTERVAL_SECS`: watchdog scan period (default: 30)
    /// - `DOCFLOW_DEQUEUE_TIMEOUT_SECS`: blocking pop timeout (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DOCFLOW_REDIS_URL") {
            config.redis_url = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_CONFERENCE_QUEUE") {
            config.conference_queue = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_EMISSION_QUEUE") {
            config.emission_queue = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_CONTROL_SET") {
            config.control_set = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_KILL_SET") {
            config.kill_set = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_INFLIGHT_HASH") {
            config.inflight_hash = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_STUCK_LOG") {
            config.stuck_log = val;
        }
        if let Ok(val) = std::env::var("DOCFLOW_RESULTS_QUEUE") {
            config.results_queue = val;
        }

        if let Ok(val) = std::env::var("DOCFLOW_ENABLED_TYPES") {
            config.enabled_types = parse_job_types(&val, "DOCFLOW_ENABLED_TYPES")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "DOCFLOW_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_MAX_WORKERS_PER_TYPE") {
            config.max_workers_per_type = parse_env_value(&val, "DOCFLOW_MAX_WORKERS_PER_TYPE")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_MAX_TOTAL_WORKERS") {
            config.max_total_workers = parse_env_value(&val, "DOCFLOW_MAX_TOTAL_WORKERS")?;
        }

        if let Ok(val) = std::env::var("DOCFLOW_REBALANCE_INTERVAL_SECS") {
            config.rebalance_interval = parse_env_secs(&val, "DOCFLOW_REBALANCE_INTERVAL_SECS")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_LIVENESS_INTERVAL_SECS") {
            config.liveness_interval = parse_env_secs(&val, "DOCFLOW_LIVENESS_INTERVAL_SECS")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_MAX_JOB_DURATION_SECS") {
            config.max_job_duration = parse_env_secs(&val, "DOCFLOW_MAX_JOB_DURATION_SECS")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_WATCHDOG_CHECK_INTERVAL_SECS") {
            config.watchdog_check_interval =
                parse_env_secs(&val, "DOCFLOW_WATCHDOG_CHECK_INTERVAL_SECS")?;
        }
        if let Ok(val) = std::env::var("DOCFLOW_DEQUEUE_TIMEOUT_SECS") {
            config.dequeue_timeout = parse_env_secs(&val, "DOCFLOW_DEQUEUE_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Returns the queue key for the given job type.
    pub fn queue_name(&self, job_type: JobType) -> &str {
        match job_type {
            JobType::Conference => &self.conference_queue,
            JobType::Emission => &self.emission_queue,
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_workers_per_type == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers_per_type must be greater than 0".to_string(),
            ));
        }

        if self.max_total_workers < self.enabled_types.len() {
            return Err(ConfigError::ValidationFailed(
                "max_total_workers must allow at least one worker per enabled type".to_string(),
            ));
        }

        if self.enabled_types.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "enabled_types cannot be empty".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for job_type in &self.enabled_types {
            if seen.contains(job_type) {
                return Err(ConfigError::ValidationFailed(format!(
                    "enabled_types contains '{}' more than once",
                    job_type
                )));
            }
            seen.push(*job_type);
        }

        for (name, value) in [
            ("rebalance_interval", self.rebalance_interval),
            ("liveness_interval", self.liveness_interval),
            ("max_job_duration", self.max_job_duration),
            ("watchdog_check_interval", self.watchdog_check_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        // BLPOP granularity is one second.
        if self.dequeue_timeout < Duration::from_secs(1) {
            return Err(ConfigError::ValidationFailed(
                "dequeue_timeout must be at least 1 second".to_string(),
            ));
        }

        for (name, value) in [
            ("redis_url", &self.redis_url),
            ("conference_queue", &self.conference_queue),
            ("emission_queue", &self.emission_queue),
            ("control_set", &self.control_set),
            ("kill_set", &self.kill_set),
            ("inflight_hash", &self.inflight_hash),
            ("stuck_log", &self.stuck_log),
            ("results_queue", &self.results_queue),
        ] {
            if value.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the enabled job types.
    pub fn with_enabled_types(mut self, types: Vec<JobType>) -> Self {
        self.enabled_types = types;
        self
    }

    /// Builder method to set the per-worker batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method to set the per-type worker cap.
    pub fn with_max_workers_per_type(mut self, max: usize) -> Self {
        self.max_workers_per_type = max;
        self
    }

    /// Builder method to set the global worker cap.
    pub fn with_max_total_workers(mut self, max: usize) -> Self {
        self.max_total_workers = max;
        self
    }

    /// Builder method to set the rebalance interval.
    pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
        self.rebalance_interval = interval;
        self
    }

    /// Builder method to set the liveness scan interval.
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Builder method to set the stuck-job deadline.
    pub fn with_max_job_duration(mut self, duration: Duration) -> Self {
        self.max_job_duration = duration;
        self
    }

    /// Builder method to set the watchdog scan interval.
    pub fn with_watchdog_check_interval(mut self, interval: Duration) -> Self {
        self.watchdog_check_interval = interval;
        self
    }

    /// Builder method to set the blocking dequeue timeout.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Builder method to prefix every store key, isolating one deployment
    /// from another on a shared Redis.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        for key in [
            &mut self.conference_queue,
            &mut self.emission_queue,
            &mut self.control_set,
            &mut self.kill_set,
            &mut self.inflight_hash,
            &mut self.stuck_log,
            &mut self.results_queue,
        ] {
            *key = format!("{}:{}", prefix, key);
        }
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a whole number of seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_env_value(value, key)?;
    Ok(Duration::from_secs(secs))
}

/// Parse a comma-separated list of job type names.
fn parse_job_types(value: &str, key: &str) -> Result<Vec<JobType>, ConfigError> {
    value
        .split(',')
        .map(|name| match name.trim().to_lowercase().as_str() {
            "conference" => Ok(JobType::Conference),
            "emission" => Ok(JobType::Emission),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("unknown job type '{}'", other),
            }),
        })
        .collect()
}
