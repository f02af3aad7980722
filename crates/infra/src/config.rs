//! Queue configuration loading and representation.

use std::time::Duration;

use thiserror::Error;

/// Default delay between poll cycles, in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 5_000;
/// Default number of jobs one queue instance runs at the same time.
pub const CONCURRENT_JOBS: usize = 2;
/// Default number of failed attempts after which a job is terminally failed.
pub const MAX_RETRIES: u32 = 3;

const ENV_POLL_INTERVAL_MS: &str = "IMPORT_QUEUE_POLL_INTERVAL_MS";
const ENV_CONCURRENT_JOBS: &str = "IMPORT_QUEUE_CONCURRENT_JOBS";
const ENV_MAX_RETRIES: &str = "IMPORT_QUEUE_MAX_RETRIES";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    NotANumber { var: &'static str, value: String },
    #[error("{var} must be at least 1")]
    Zero { var: &'static str },
}

/// Import queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Sleep between poll cycles
    pub poll_interval: Duration,
    /// Maximum tracked in-flight executions for this instance
    pub concurrent_jobs: usize,
    /// Retry ceiling; a job fails terminally when its error count reaches it
    pub max_retries: u32,
    /// Name for logging
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            concurrent_jobs: CONCURRENT_JOBS,
            max_retries: MAX_RETRIES,
            name: "import-queue".to_string(),
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `IMPORT_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, ENV_CONCURRENT_JOBS)? {
            if n == 0 {
                return Err(ConfigError::Zero {
                    var: ENV_CONCURRENT_JOBS,
                });
            }
            config.concurrent_jobs = n;
        }
        if let Some(n) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES)? {
            if n == 0 {
                return Err(ConfigError::Zero {
                    var: ENV_MAX_RETRIES,
                });
            }
            config.max_retries = n;
        }

        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrent_jobs(mut self, max: usize) -> Self {
        self.concurrent_jobs = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::NotANumber { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_constants() {
        let config = QueueConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(5_000));
        assert_eq!(config.concurrent_jobs, 2);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_CONCURRENT_JOBS, "8"),
            (ENV_MAX_RETRIES, " 5 "),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.concurrent_jobs, 8);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn missing_vars_keep_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = QueueConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotANumber { var: ENV_POLL_INTERVAL_MS, .. }));

        let err = QueueConfig::from_lookup(lookup(&[(ENV_CONCURRENT_JOBS, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { var: ENV_CONCURRENT_JOBS });

        let err = QueueConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { var: ENV_MAX_RETRIES });
    }

    #[test]
    fn builders_clamp_to_one() {
        let config = QueueConfig::default()
            .with_concurrent_jobs(0)
            .with_max_retries(0);
        assert_eq!(config.concurrent_jobs, 1);
        assert_eq!(config.max_retries, 1);
    }
}
