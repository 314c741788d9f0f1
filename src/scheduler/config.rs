//! Scheduler configuration.
//!
//! Values resolve in the order defaults < YAML file < environment. All
//! `*_ms` fields are milliseconds; `Duration` accessors are provided for
//! the runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard upper bound on the pool size regardless of host parallelism.
pub const ABSOLUTE_MAX_WORKERS: usize = 64;

/// Default pool ceiling before host parallelism is considered.
const DEFAULT_MAX_WORKERS: usize = 8;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the job scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    // Pool bounds
    /// Minimum number of live workers.
    pub min_workers: usize,
    /// Maximum number of live workers (capped by host parallelism).
    pub max_workers: usize,
    /// Idle time after which a surplus worker is removed.
    pub worker_idle_timeout_ms: u64,
    /// How long a new worker may take to signal ready.
    pub worker_spawn_timeout_ms: u64,
    /// Maximum workers created in a single scaling evaluation.
    pub max_spawns_per_tick: usize,

    // Job policy
    /// Per-attempt timeout for jobs that do not set one.
    pub default_job_timeout_ms: u64,
    /// Retry budget for jobs that do not set one.
    pub default_max_retries: u32,
    /// Priority for jobs that do not set one.
    pub default_priority: u32,
    /// Highest (least urgent) priority number; demotion stops here.
    pub priority_ceiling: u32,

    // Dispatch
    /// Interval between dispatcher ticks.
    pub queue_process_interval_ms: u64,
    /// Maximum number of pending jobs.
    pub max_queue_size: usize,

    // Results
    /// Number of terminal results kept in the ledger.
    pub ledger_capacity: usize,
    /// Number of recent results used for the moving average.
    pub stats_window: usize,
    /// Poll interval used by `await_job`.
    pub await_poll_interval_ms: u64,

    // Lifecycle
    /// How long shutdown waits for in-flight jobs before terminating workers.
    pub shutdown_grace_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: DEFAULT_MAX_WORKERS.min(host_parallelism()),
            worker_idle_timeout_ms: 60_000,
            worker_spawn_timeout_ms: 5_000,
            max_spawns_per_tick: 3,

            default_job_timeout_ms: 300_000, // 5 minutes
            default_max_retries: 3,
            default_priority: 3,
            priority_ceiling: 5,

            queue_process_interval_ms: 100,
            max_queue_size: 1000,

            ledger_capacity: 1000,
            stats_window: 100,
            await_poll_interval_ms: 100,

            shutdown_grace_period_ms: 30_000,
        }
    }
}

/// Returns the number of CPUs the process may run on.
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_MIN_WORKERS`
    /// - `JOBFORGE_MAX_WORKERS`
    /// - `JOBFORGE_WORKER_IDLE_TIMEOUT_MS`
    /// - `JOBFORGE_DEFAULT_JOB_TIMEOUT_MS`
    /// - `JOBFORGE_QUEUE_PROCESS_INTERVAL_MS`
    /// - `JOBFORGE_MAX_QUEUE_SIZE`
    /// - `JOBFORGE_DEFAULT_MAX_RETRIES`
    /// - `JOBFORGE_PRIORITY_CEILING`
    /// - `JOBFORGE_SHUTDOWN_GRACE_PERIOD_MS`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `JOBFORGE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = env_value("JOBFORGE_MIN_WORKERS")? {
            self.min_workers = val;
        }
        if let Some(val) = env_value("JOBFORGE_MAX_WORKERS")? {
            self.max_workers = val;
        }
        if let Some(val) = env_value("JOBFORGE_WORKER_IDLE_TIMEOUT_MS")? {
            self.worker_idle_timeout_ms = val;
        }
        if let Some(val) = env_value("JOBFORGE_DEFAULT_JOB_TIMEOUT_MS")? {
            self.default_job_timeout_ms = val;
        }
        if let Some(val) = env_value("JOBFORGE_QUEUE_PROCESS_INTERVAL_MS")? {
            self.queue_process_interval_ms = val;
        }
        if let Some(val) = env_value("JOBFORGE_MAX_QUEUE_SIZE")? {
            self.max_queue_size = val;
        }
        if let Some(val) = env_value("JOBFORGE_DEFAULT_MAX_RETRIES")? {
            self.default_max_retries = val;
        }
        if let Some(val) = env_value("JOBFORGE_PRIORITY_CEILING")? {
            self.priority_ceiling = val;
        }
        if let Some(val) = env_value("JOBFORGE_SHUTDOWN_GRACE_PERIOD_MS")? {
            self.shutdown_grace_period_ms = val;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }

        if self.max_spawns_per_tick == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_spawns_per_tick must be greater than 0".to_string(),
            ));
        }

        let intervals = [
            ("worker_idle_timeout_ms", self.worker_idle_timeout_ms),
            ("worker_spawn_timeout_ms", self.worker_spawn_timeout_ms),
            ("default_job_timeout_ms", self.default_job_timeout_ms),
            ("queue_process_interval_ms", self.queue_process_interval_ms),
            ("await_poll_interval_ms", self.await_poll_interval_ms),
            ("shutdown_grace_period_ms", self.shutdown_grace_period_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_queue_size must be greater than 0".to_string(),
            ));
        }

        if self.ledger_capacity == 0 || self.stats_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "ledger_capacity and stats_window must be greater than 0".to_string(),
            ));
        }

        if self.default_priority == 0 || self.default_priority > self.priority_ceiling {
            return Err(ConfigError::ValidationFailed(format!(
                "default_priority must be between 1 and priority_ceiling ({})",
                self.priority_ceiling
            )));
        }

        Ok(())
    }

    /// Returns the pool ceiling after applying host and absolute caps.
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers
            .min(host_parallelism())
            .min(ABSOLUTE_MAX_WORKERS)
            .max(1)
    }

    /// Returns the pool floor, never above the effective ceiling.
    pub fn effective_min_workers(&self) -> usize {
        self.min_workers.min(self.effective_max_workers())
    }

    /// Interval between dispatcher ticks.
    pub fn queue_process_interval(&self) -> Duration {
        Duration::from_millis(self.queue_process_interval_ms)
    }

    /// Idle time after which a surplus worker is removed.
    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    /// How long a new worker may take to signal ready.
    pub fn worker_spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_spawn_timeout_ms)
    }

    /// Poll interval used by `await_job`.
    pub fn await_poll_interval(&self) -> Duration {
        Duration::from_millis(self.await_poll_interval_ms)
    }

    /// Shutdown grace period.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Builder method to set worker bounds.
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Builder method to set the worker idle timeout.
    pub fn with_worker_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.worker_idle_timeout_ms = ms;
        self
    }

    /// Builder method to set the default job timeout.
    pub fn with_default_job_timeout_ms(mut self, ms: u64) -> Self {
        self.default_job_timeout_ms = ms;
        self
    }

    /// Builder method to set the default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Builder method to set the priority ceiling.
    pub fn with_priority_ceiling(mut self, ceiling: u32) -> Self {
        self.priority_ceiling = ceiling;
        self
    }

    /// Builder method to set the dispatcher tick interval.
    pub fn with_queue_process_interval_ms(mut self, ms: u64) -> Self {
        self.queue_process_interval_ms = ms;
        self
    }

    /// Builder method to set the queue capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Builder method to set the ledger capacity.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }

    /// Builder method to set the await poll interval.
    pub fn with_await_poll_interval_ms(mut self, ms: u64) -> Self {
        self.await_poll_interval_ms = ms;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_grace_period_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_period_ms = ms;
        self
    }
}

/// Reads and parses an environment variable if it is set.
fn env_value<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.priority_ceiling, 5);
        assert_eq!(config.max_spawns_per_tick, 3);
        assert!(config.max_workers <= host_parallelism());
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let config = SchedulerConfig::default().with_workers(4, 2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(SchedulerConfig::default()
            .with_queue_process_interval_ms(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_max_queue_size(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_workers(0, 0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validation_rejects_default_priority_above_ceiling() {
        let config = SchedulerConfig::default().with_priority_ceiling(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_bounds_respect_host() {
        let config = SchedulerConfig::default().with_workers(2, 10_000);
        let max = config.effective_max_workers();
        assert!(max <= host_parallelism());
        assert!(max <= ABSOLUTE_MAX_WORKERS);
        assert!(config.effective_min_workers() <= max);
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "min_workers: 1\nmax_queue_size: 42\npriority_ceiling: 7").expect("write");

        let config = SchedulerConfig::from_yaml_file(file.path()).expect("valid yaml");
        assert_eq!(config.max_queue_size, 42);
        assert_eq!(config.priority_ceiling, 7);
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn test_yaml_file_with_invalid_values_fails() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_queue_size: 0").expect("write");

        assert!(SchedulerConfig::from_yaml_file(file.path()).is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = SchedulerConfig::default()
            .with_queue_process_interval_ms(25)
            .with_shutdown_grace_period_ms(1500);
        assert_eq!(config.queue_process_interval(), Duration::from_millis(25));
        assert_eq!(config.shutdown_grace_period(), Duration::from_millis(1500));
    }
}
