//! Director configuration.
//!
//! Limits, pool sizing, polling cadence and logging verbosity for the
//! director. Values come from `Default`, `with_*` builder methods, or the
//! environment via [`DirectorConfig::from_env`].

use std::time::Duration;
use thiserror::Error;

use crate::store::FetchOrder;

/// Default maximum number of items held in the director queue.
pub const DEFAULT_QUEUE_LIMIT: usize = 5000;

/// Default maximum number of items handed to one worker per tick.
pub const DEFAULT_PER_WORKER_LIMIT: usize = 1500;

/// Default number of base workers.
pub const DEFAULT_THREADS: usize = 1;

/// Default ceiling on the pool size when dynamic scaling is enabled.
pub const DEFAULT_WORKERS_LIMIT: usize = 10;

/// Default interval between ticks.
pub const DEFAULT_WORK_LOOP_INTERVAL: Duration = Duration::from_millis(1000);

/// Errors that can occur while building or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// No store was supplied to the director.
    #[error("A queue store connection is required")]
    MissingStore,

    /// No work function was supplied for workers.
    #[error("A work function is required")]
    MissingWorkFunction,

    /// An extension uses a name that is already taken.
    #[error("Unavailable name '{name}' for {scope} extension")]
    ExtensionNameCollision { scope: String, name: String },
}

/// Dynamic scaling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicThreads {
    /// Maximum number of workers, base workers included.
    pub workers_limit: usize,
}

impl Default for DynamicThreads {
    fn default() -> Self {
        Self {
            workers_limit: DEFAULT_WORKERS_LIMIT,
        }
    }
}

/// Configuration for the director.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorConfig {
    /// Maximum number of items fetched into the director queue per refill.
    pub queue_limit: usize,
    /// Maximum number of items assigned to one worker per tick.
    pub per_worker_limit: usize,
    /// Number of base workers created by `run()`.
    pub threads: usize,
    /// Dynamic scaling; `None` keeps the pool at `threads` workers.
    pub dynamic_threads: Option<DynamicThreads>,
    /// Interval between ticks.
    pub work_loop_interval: Duration,
    /// Fetch keys by priority (sorted set) instead of random sample (set).
    pub prioritized_queue: bool,
    /// Verbose logging through the director logger.
    pub detail_log: bool,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_QUEUE_LIMIT,
            per_worker_limit: DEFAULT_PER_WORKER_LIMIT,
            threads: DEFAULT_THREADS,
            dynamic_threads: None,
            work_loop_interval: DEFAULT_WORK_LOOP_INTERVAL,
            prioritized_queue: false,
            detail_log: false,
        }
    }
}

impl DirectorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DIRECTOR_QUEUE_LIMIT`: Queue capacity (default: 5000)
    /// - `DIRECTOR_PER_WORKER_LIMIT`: Items per worker per tick (default: 1500)
    /// - `DIRECTOR_THREADS`: Base worker count (default: 1)
    /// - `DIRECTOR_WORKERS_LIMIT`: Enables dynamic scaling with this ceiling
    /// - `DIRECTOR_INTERVAL_MS`: Tick interval in milliseconds (default: 1000)
    /// - `DIRECTOR_PRIORITIZED`: Priority fetch mode (default: false)
    /// - `DIRECTOR_DETAIL_LOG`: Verbose logging (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("DIRECTOR_QUEUE_LIMIT") {
            config.queue_limit = parse_env_value(&val, "DIRECTOR_QUEUE_LIMIT")?;
        }

        if let Some(val) = lookup("DIRECTOR_PER_WORKER_LIMIT") {
            config.per_worker_limit = parse_env_value(&val, "DIRECTOR_PER_WORKER_LIMIT")?;
        }

        if let Some(val) = lookup("DIRECTOR_THREADS") {
            config.threads = parse_env_value(&val, "DIRECTOR_THREADS")?;
        }

        if let Some(val) = lookup("DIRECTOR_WORKERS_LIMIT") {
            config.dynamic_threads = Some(DynamicThreads {
                workers_limit: parse_env_value(&val, "DIRECTOR_WORKERS_LIMIT")?,
            });
        }

        if let Some(val) = lookup("DIRECTOR_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "DIRECTOR_INTERVAL_MS")?;
            config.work_loop_interval = Duration::from_millis(millis);
        }

        if let Some(val) = lookup("DIRECTOR_PRIORITIZED") {
            config.prioritized_queue = parse_env_bool(&val, "DIRECTOR_PRIORITIZED")?;
        }

        if let Some(val) = lookup("DIRECTOR_DETAIL_LOG") {
            config.detail_log = parse_env_bool(&val, "DIRECTOR_DETAIL_LOG")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_limit must be greater than 0".to_string(),
            ));
        }

        if self.per_worker_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "per_worker_limit must be greater than 0".to_string(),
            ));
        }

        if self.threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "threads must be greater than 0".to_string(),
            ));
        }

        if self.work_loop_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "work_loop_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(dynamic) = self.dynamic_threads {
            if dynamic.workers_limit < self.threads {
                return Err(ConfigError::ValidationFailed(format!(
                    "workers_limit ({}) cannot be lower than threads ({})",
                    dynamic.workers_limit, self.threads
                )));
            }
        }

        Ok(())
    }

    /// The fetch order selected by `prioritized_queue`.
    pub fn fetch_order(&self) -> FetchOrder {
        FetchOrder::from_prioritized(self.prioritized_queue)
    }

    /// Ceiling on the pool size, if dynamic scaling is enabled.
    pub fn workers_limit(&self) -> Option<usize> {
        self.dynamic_threads.map(|d| d.workers_limit)
    }

    /// Builder method to set the queue limit.
    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    /// Builder method to set the per-worker limit.
    pub fn with_per_worker_limit(mut self, limit: usize) -> Self {
        self.per_worker_limit = limit;
        self
    }

    /// Builder method to set the base worker count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Builder method to enable dynamic scaling up to `workers_limit` workers.
    pub fn with_dynamic_threads(mut self, workers_limit: usize) -> Self {
        self.dynamic_threads = Some(DynamicThreads { workers_limit });
        self
    }

    /// Builder method to set the tick interval.
    pub fn with_work_loop_interval(mut self, interval: Duration) -> Self {
        self.work_loop_interval = interval;
        self
    }

    /// Builder method to enable or disable priority fetching.
    pub fn with_prioritized_queue(mut self, prioritized: bool) -> Self {
        self.prioritized_queue = prioritized;
        self
    }

    /// Builder method to enable or disable detail logging.
    pub fn with_detail_log(mut self, detail: bool) -> Self {
        self.detail_log = detail;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
