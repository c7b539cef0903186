//! Configuration for the janitor service.
//!
//! Configuration is loaded from a YAML file, overridden by `JANITOR_*`
//! environment variables, and validated before any component starts.
//!
//! ```yaml
//! database_url: sqlite://janitor.db
//! runner:
//!   max_concurrency: 8
//!   worker_command: ["janitor-worker", "--json"]
//! scheduler:
//!   queue_depth: 500
//!   weights: { success: 10.0, staleness: 0.1 }
//!   suite_priorities: { lintian-fixes: 2.0 }
//! publisher:
//!   max_open_per_maintainer: 3
//!   rate_limiter: slow-start
//!   default_mode: propose
//!   trust:
//!     - target_prefix: https://salsa.debian.org/janitor-team/
//!       mode: push
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PublishMode;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// SQLite database URL, e.g. `sqlite://janitor.db`.
    pub database_url: String,
    /// Address the HTTP API listens on.
    pub listen_address: String,
    pub runner: RunnerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub publisher: PublisherConfig,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://janitor.db".to_string(),
            listen_address: "127.0.0.1:9911".to_string(),
            runner: RunnerConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

/// Dispatch and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of concurrently leased runs on local workers.
    pub max_concurrency: usize,
    /// A lease expires when no heartbeat arrives within this many seconds.
    pub heartbeat_timeout_secs: u64,
    /// A lease expires when the run exceeds this many seconds in total.
    pub overall_timeout_secs: u64,
    /// How often the dispatch loop polls the queue and reaps leases.
    pub poll_interval_ms: u64,
    /// How long to wait for a worker to accept or acknowledge a cancel.
    pub signal_timeout_secs: u64,
    /// Never run two suites of the same target concurrently.
    pub one_run_per_target: bool,
    /// Name of the local worker.
    pub worker_name: String,
    /// Command implementing the worker protocol; no local worker if unset.
    pub worker_command: Option<Vec<String>>,
    /// Suites the local worker accepts; all suites if unset.
    pub worker_suites: Option<Vec<String>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            heartbeat_timeout_secs: 60,
            overall_timeout_secs: 5 * 3600,
            poll_interval_ms: 1000,
            signal_timeout_secs: 10,
            one_run_per_target: true,
            worker_name: "local".to_string(),
            worker_command: None,
            worker_suites: None,
        }
    }
}

/// Retry budget for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt before a transient failure becomes permanent.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub base_backoff_secs: u64,
    /// Upper bound on backoff.
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 60,
            max_backoff_secs: 6 * 3600,
        }
    }
}

/// Weights of the ranking terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    /// Weight of the estimated publish likelihood.
    pub success: f64,
    /// Fraction of the likelihood term removed when the maintainer is at quota.
    pub quota_penalty: f64,
    /// Weight per hour since the last attempt.
    pub staleness: f64,
    /// Weight of the configured suite priority.
    pub suite: f64,
    /// Weight of the importer-assigned candidate value.
    pub value: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            success: 10.0,
            quota_penalty: 0.8,
            staleness: 0.1,
            suite: 1.0,
            value: 1.0,
        }
    }
}

/// Scheduler cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler cycles.
    pub interval_secs: u64,
    /// Maximum number of scheduler-admitted items in the queue.
    pub queue_depth: usize,
    /// Staleness assumed for candidates that were never attempted.
    pub never_attempted_staleness_hours: f64,
    pub weights: RankingWeights,
    /// Per-suite priority, 0 for unlisted suites.
    pub suite_priorities: HashMap<String, f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            queue_depth: 1000,
            never_attempted_staleness_hours: 24.0 * 30.0,
            weights: RankingWeights::default(),
            suite_priorities: HashMap::new(),
        }
    }
}

/// How the open-proposal limit is computed for a maintainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimiterKind {
    /// No limit; counts are still tracked.
    None,
    /// A fixed maximum per maintainer.
    Fixed,
    /// Start at one and grow with each merged proposal up to the maximum.
    SlowStart,
}

/// Selects a publish mode for matching runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRule {
    /// Matches targets starting with this prefix; all targets if unset.
    #[serde(default)]
    pub target_prefix: Option<String>,
    /// Matches this suite only; all suites if unset.
    #[serde(default)]
    pub suite: Option<String>,
    /// Mode for matching runs.
    pub mode: PublishMode,
}

/// Publisher cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Seconds between publisher cycles.
    pub interval_secs: u64,
    /// Maximum open proposals per maintainer.
    pub max_open_per_maintainer: Option<u32>,
    pub rate_limiter: RateLimiterKind,
    /// Mode for runs matching no trust rule.
    pub default_mode: PublishMode,
    /// First matching rule wins.
    pub trust: Vec<TrustRule>,
    /// Ask the publish action not to perform external side effects.
    pub dry_run: bool,
    /// Command implementing the publish action.
    pub command: Option<Vec<String>>,
    /// Seconds before a publish action call is abandoned.
    pub action_timeout_secs: u64,
    /// Maximum runs considered per cycle.
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            max_open_per_maintainer: Some(5),
            rate_limiter: RateLimiterKind::Fixed,
            default_mode: PublishMode::Propose,
            trust: Vec::new(),
            dry_run: false,
            command: None,
            action_timeout_secs: 300,
            batch_size: 100,
        }
    }
}

impl JanitorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the local concurrency ceiling.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.runner.max_concurrency = max;
        self
    }

    /// Sets the per-maintainer open proposal limit.
    pub fn with_max_open_per_maintainer(mut self, max: Option<u32>) -> Self {
        self.publisher.max_open_per_maintainer = max;
        self
    }

    /// Loads configuration from a YAML file and the environment.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be parsed, an environment
    /// variable is invalid, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Self>(&raw)?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `JANITOR_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("JANITOR_DATABASE_URL") {
            self.database_url = val;
        }

        if let Some(val) = lookup("JANITOR_LISTEN_ADDRESS") {
            self.listen_address = val;
        }

        if let Some(val) = lookup("JANITOR_MAX_CONCURRENCY") {
            self.runner.max_concurrency = parse_env_value(&val, "JANITOR_MAX_CONCURRENCY")?;
        }

        if let Some(val) = lookup("JANITOR_HEARTBEAT_TIMEOUT_SECS") {
            self.runner.heartbeat_timeout_secs =
                parse_env_value(&val, "JANITOR_HEARTBEAT_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("JANITOR_MAX_RETRIES") {
            self.retry.max_retries = parse_env_value(&val, "JANITOR_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("JANITOR_QUEUE_DEPTH") {
            self.scheduler.queue_depth = parse_env_value(&val, "JANITOR_QUEUE_DEPTH")?;
        }

        if let Some(val) = lookup("JANITOR_MAX_OPEN_PER_MAINTAINER") {
            self.publisher.max_open_per_maintainer =
                Some(parse_env_value(&val, "JANITOR_MAX_OPEN_PER_MAINTAINER")?);
        }

        if let Some(val) = lookup("JANITOR_DRY_RUN") {
            self.publisher.dry_run = parse_env_bool(&val, "JANITOR_DRY_RUN")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        // Runner validation
        if self.runner.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "runner.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.runner.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "runner.heartbeat_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.runner.overall_timeout_secs < self.runner.heartbeat_timeout_secs {
            return Err(ConfigError::ValidationFailed(
                "runner.overall_timeout_secs must be at least the heartbeat timeout".to_string(),
            ));
        }

        if matches!(&self.runner.worker_command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "runner.worker_command cannot be empty".to_string(),
            ));
        }

        // Retry validation
        if self.retry.base_backoff_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.base_backoff_secs must be greater than 0".to_string(),
            ));
        }

        if self.retry.base_backoff_secs > self.retry.max_backoff_secs {
            return Err(ConfigError::ValidationFailed(
                "retry.base_backoff_secs cannot exceed retry.max_backoff_secs".to_string(),
            ));
        }

        // Scheduler validation
        if self.scheduler.queue_depth == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.queue_depth must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.interval_secs == 0 || self.publisher.interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "cycle intervals must be greater than 0".to_string(),
            ));
        }

        let w = &self.scheduler.weights;
        if !(w.staleness > 0.0 && w.staleness.is_finite()) {
            return Err(ConfigError::ValidationFailed(
                "scheduler.weights.staleness must be positive so no candidate starves".to_string(),
            ));
        }

        if [w.success, w.suite, w.value]
            .iter()
            .any(|v| *v < 0.0 || !v.is_finite())
        {
            return Err(ConfigError::ValidationFailed(
                "scheduler.weights must be finite and non-negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&w.quota_penalty) {
            return Err(ConfigError::ValidationFailed(
                "scheduler.weights.quota_penalty must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.scheduler.never_attempted_staleness_hours < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.never_attempted_staleness_hours cannot be negative".to_string(),
            ));
        }

        // Publisher validation
        if self.publisher.rate_limiter != RateLimiterKind::None
            && self.publisher.max_open_per_maintainer.is_none()
        {
            return Err(ConfigError::ValidationFailed(
                "publisher.max_open_per_maintainer is required by the rate limiter".to_string(),
            ));
        }

        if matches!(&self.publisher.command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "publisher.command cannot be empty".to_string(),
            ));
        }

        if self.publisher.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "publisher.batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
