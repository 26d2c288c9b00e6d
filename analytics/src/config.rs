//! Configuration for the analytics pipeline.
//!
//! Every knob has a default suitable for embedding in the game client;
//! environment variables override them for development and testing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `POPMETRICS_DATA_DIR` | `~/.popmetrics` | Data directory for stores and consent |
//! | `POPMETRICS_ENABLED` | `true` | Master switch for collection |
//! | `POPMETRICS_ANONYMIZE` | `true` | Apply anonymization rules to payloads |
//! | `POPMETRICS_BATCH_SIZE` | 50 | Buffered events that trigger a flush (> 0) |
//! | `POPMETRICS_BATCH_TIMEOUT_MS` | 5000 | Flush deadline after the first buffered event (> 0) |
//! | `POPMETRICS_MAX_BATCH_DELAY_MS` | 30000 | Ceiling between flushes under trickle load (>= timeout) |
//! | `POPMETRICS_MAX_RETRIES` | 3 | Retries per failed batch (0-10) |
//! | `POPMETRICS_BASE_RETRY_DELAY_MS` | 1000 | First retry delay, doubling per attempt (> 0) |
//! | `POPMETRICS_RETENTION_DAYS` | 30 | Age cutoff enforced by periodic cleanup (> 0) |
//! | `POPMETRICS_CLEANUP_INTERVAL_SECS` | 86400 | Seconds between cleanup passes (> 0) |
//!
//! # Example
//!
//! ```no_run
//! use popmetrics_analytics::config::AnalyticsConfig;
//!
//! let config = AnalyticsConfig::from_env().expect("failed to load configuration");
//! println!("flushing every {} events", config.batch_size);
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_RETRIES};

/// Default data directory name relative to home.
const DEFAULT_DATA_DIR_NAME: &str = ".popmetrics";

/// Default number of buffered events that triggers a threshold flush.
const DEFAULT_BATCH_SIZE: usize = 50;

/// Default flush deadline after the first buffered event, in milliseconds.
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5_000;

/// Default ceiling on the gap between flushes, in milliseconds.
const DEFAULT_MAX_BATCH_DELAY_MS: u64 = 30_000;

/// Default retention window for raw event data, in days.
const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Default period between cleanup passes, in seconds (one day).
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 86_400;

/// Maximum allowed retry budget.
const MAX_RETRY_LIMIT: u32 = 10;

/// Errors that can occur during configuration parsing or validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine the home directory for the default data dir.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the analytics collector and its pipeline.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Directory holding store logs, the manifest, and the consent record.
    pub data_dir: PathBuf,

    /// Master switch; when false, collection calls are no-ops.
    pub enabled: bool,

    /// Whether payloads pass through the anonymization rules.
    pub anonymize_data: bool,

    /// Buffered-event count that triggers an immediate flush.
    pub batch_size: usize,

    /// Flush deadline measured from the first event in the buffer.
    pub batch_timeout: Duration,

    /// Hard ceiling on the time between flushes under trickle load.
    pub max_batch_delay: Duration,

    /// Retries allowed per failed batch, after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles with each attempt.
    pub base_retry_delay: Duration,

    /// Age beyond which raw event records are pruned.
    pub retention: Duration,

    /// Period between automatic cleanup passes.
    pub cleanup_interval: Duration,
}

impl AnalyticsConfig {
    /// Creates a configuration from environment variables, falling back
    /// to the defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a variable cannot be parsed, a value
    /// fails validation, or no data directory can be determined.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = match env::var("POPMETRICS_DATA_DIR") {
            Ok(val) => PathBuf::from(val),
            Err(_) => default_data_dir().ok_or(ConfigError::NoHomeDirectory)?,
        };

        let enabled = parse_bool_env("POPMETRICS_ENABLED")?.unwrap_or(true);
        let anonymize_data = parse_bool_env("POPMETRICS_ANONYMIZE")?.unwrap_or(true);

        let batch_size =
            parse_env::<usize>("POPMETRICS_BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_timeout = Duration::from_millis(
            parse_env("POPMETRICS_BATCH_TIMEOUT_MS")?.unwrap_or(DEFAULT_BATCH_TIMEOUT_MS),
        );
        let max_batch_delay = Duration::from_millis(
            parse_env("POPMETRICS_MAX_BATCH_DELAY_MS")?.unwrap_or(DEFAULT_MAX_BATCH_DELAY_MS),
        );
        let max_retries = parse_env("POPMETRICS_MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES);
        let base_retry_delay = Duration::from_millis(
            parse_env("POPMETRICS_BASE_RETRY_DELAY_MS")?.unwrap_or(DEFAULT_BASE_DELAY_MS),
        );
        let retention_days =
            parse_env::<u64>("POPMETRICS_RETENTION_DAYS")?.unwrap_or(DEFAULT_RETENTION_DAYS);
        let cleanup_interval = Duration::from_secs(
            parse_env("POPMETRICS_CLEANUP_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
        );

        let config = Self {
            data_dir,
            enabled,
            anonymize_data,
            batch_size,
            batch_timeout,
            max_batch_delay,
            max_retries,
            base_retry_delay,
            retention: Duration::from_secs(retention_days.saturating_mul(86_400)),
            cleanup_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field constraints the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending
    /// setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid(
                "POPMETRICS_BATCH_SIZE",
                "batch size must be greater than 0",
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(invalid(
                "POPMETRICS_BATCH_TIMEOUT_MS",
                "batch timeout must be greater than 0",
            ));
        }
        if self.max_batch_delay < self.batch_timeout {
            return Err(invalid(
                "POPMETRICS_MAX_BATCH_DELAY_MS",
                "max batch delay must be at least the batch timeout",
            ));
        }
        if self.max_retries > MAX_RETRY_LIMIT {
            return Err(invalid(
                "POPMETRICS_MAX_RETRIES",
                "retry budget must be at most 10",
            ));
        }
        if self.base_retry_delay.is_zero() {
            return Err(invalid(
                "POPMETRICS_BASE_RETRY_DELAY_MS",
                "base retry delay must be greater than 0",
            ));
        }
        if self.retention.is_zero() {
            return Err(invalid(
                "POPMETRICS_RETENTION_DAYS",
                "retention must be at least one day",
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid(
                "POPMETRICS_CLEANUP_INTERVAL_SECS",
                "cleanup interval must be greater than 0",
            ));
        }
        Ok(())
    }

    /// The retry schedule derived from this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_retry_delay)
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR_NAME)),
            enabled: true,
            anonymize_data: true,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            max_batch_delay: Duration::from_millis(DEFAULT_MAX_BATCH_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 86_400),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

/// `~/.popmetrics`, when a home directory exists.
fn default_data_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_DATA_DIR_NAME))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(val) => val.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a number, got '{val}'"),
        }),
        Err(_) => Ok(None),
    }
}

/// Accepts `true`/`false` and `1`/`0`, case-insensitively.
fn parse_bool_env(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected true/false or 1/0, got '{val}'"),
            }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all POPMETRICS_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("POPMETRICS_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn defaults_apply_when_nothing_is_set() {
        with_clean_env(|| {
            let config = AnalyticsConfig::from_env().expect("should build default config");

            assert!(config.enabled);
            assert!(config.anonymize_data);
            assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
            assert_eq!(config.batch_timeout, Duration::from_millis(5_000));
            assert_eq!(config.max_batch_delay, Duration::from_millis(30_000));
            assert_eq!(config.max_retries, 3);
            assert_eq!(config.base_retry_delay, Duration::from_millis(1_000));
            assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
            assert!(config.data_dir.ends_with(DEFAULT_DATA_DIR_NAME));
        });
    }

    #[test]
    #[serial]
    fn environment_overrides_every_setting() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_DATA_DIR", "/tmp/metrics-test");
            env::set_var("POPMETRICS_ENABLED", "false");
            env::set_var("POPMETRICS_ANONYMIZE", "0");
            env::set_var("POPMETRICS_BATCH_SIZE", "25");
            env::set_var("POPMETRICS_BATCH_TIMEOUT_MS", "2000");
            env::set_var("POPMETRICS_MAX_BATCH_DELAY_MS", "10000");
            env::set_var("POPMETRICS_MAX_RETRIES", "5");
            env::set_var("POPMETRICS_BASE_RETRY_DELAY_MS", "500");
            env::set_var("POPMETRICS_RETENTION_DAYS", "7");
            env::set_var("POPMETRICS_CLEANUP_INTERVAL_SECS", "3600");

            let config = AnalyticsConfig::from_env().expect("should parse full config");

            assert_eq!(config.data_dir, PathBuf::from("/tmp/metrics-test"));
            assert!(!config.enabled);
            assert!(!config.anonymize_data);
            assert_eq!(config.batch_size, 25);
            assert_eq!(config.batch_timeout, Duration::from_millis(2_000));
            assert_eq!(config.max_batch_delay, Duration::from_millis(10_000));
            assert_eq!(config.max_retries, 5);
            assert_eq!(config.base_retry_delay, Duration::from_millis(500));
            assert_eq!(config.retention, Duration::from_secs(7 * 86_400));
            assert_eq!(config.cleanup_interval, Duration::from_secs(3_600));
        });
    }

    #[test]
    #[serial]
    fn unparseable_number_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_BATCH_SIZE", "not-a-number");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "POPMETRICS_BATCH_SIZE"
            ));
        });
    }

    #[test]
    #[serial]
    fn zero_batch_size_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_BATCH_SIZE", "0");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "POPMETRICS_BATCH_SIZE" && message.contains("greater than 0")
            ));
        });
    }

    #[test]
    #[serial]
    fn max_delay_below_timeout_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_BATCH_TIMEOUT_MS", "5000");
            env::set_var("POPMETRICS_MAX_BATCH_DELAY_MS", "1000");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. }
                    if key == "POPMETRICS_MAX_BATCH_DELAY_MS"
            ));
        });
    }

    #[test]
    #[serial]
    fn oversized_retry_budget_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_MAX_RETRIES", "11");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "POPMETRICS_MAX_RETRIES" && message.contains("at most 10")
            ));
        });
    }

    #[test]
    #[serial]
    fn malformed_bool_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_ENABLED", "maybe");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "POPMETRICS_ENABLED"
            ));
        });
    }

    #[test]
    #[serial]
    fn zero_retention_is_rejected() {
        with_clean_env(|| {
            env::set_var("POPMETRICS_RETENTION_DAYS", "0");

            let err = AnalyticsConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "POPMETRICS_RETENTION_DAYS"
            ));
        });
    }

    #[test]
    fn retry_policy_mirrors_the_config() {
        let config = AnalyticsConfig {
            max_retries: 2,
            base_retry_delay: Duration::from_millis(250),
            ..AnalyticsConfig::default()
        };

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    }

    #[test]
    fn default_config_passes_validation() {
        AnalyticsConfig::default().validate().expect("defaults are valid");
    }
}
