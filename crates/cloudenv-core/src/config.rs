// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::activator::FaultRetryPolicy;
use crate::dispatcher::DEFAULT_MAX_WORKFLOW_AGE;
use crate::worker::WorkerConfig;

/// Continuation engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane region this process serves
    pub region: String,
    /// PostgreSQL connection URL; in-memory backends are used when absent
    pub database_url: Option<String>,
    /// Queue worker settings
    pub worker: WorkerConfig,
    /// Age after which a workflow is no longer dispatched
    pub max_workflow_age: Duration,
    /// Backoff for faulted steps
    pub fault_retry: FaultRetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CLOUDENV_REGION`: control-plane region of this process
    ///
    /// Optional (with defaults):
    /// - `CLOUDENV_DATABASE_URL`: PostgreSQL connection string (default: none)
    /// - `CLOUDENV_WORKER_CONCURRENCY`: concurrent activations (default: 8)
    /// - `CLOUDENV_WORKER_BATCH_SIZE`: messages per pull (default: 16)
    /// - `CLOUDENV_POLL_INTERVAL_MS`: queue poll interval (default: 500)
    /// - `CLOUDENV_VISIBILITY_TIMEOUT_SECS`: message lease (default: 300)
    /// - `CLOUDENV_MAX_DEQUEUE_COUNT`: deliveries before a message is dropped (default: 10)
    /// - `CLOUDENV_MAX_WORKFLOW_AGE_SECS`: workflow expiry (default: 3600)
    /// - `CLOUDENV_FAULT_MAX_ATTEMPTS`: attempts per faulted step (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let region = std::env::var("CLOUDENV_REGION")
            .map_err(|_| ConfigError::Missing("CLOUDENV_REGION"))?;
        if region.trim().is_empty() {
            return Err(ConfigError::Invalid("CLOUDENV_REGION", "must not be empty"));
        }

        let database_url = std::env::var("CLOUDENV_DATABASE_URL").ok();

        let defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            concurrency: parse_var(
                "CLOUDENV_WORKER_CONCURRENCY",
                defaults.concurrency,
                "must be a positive integer",
            )?,
            batch_size: parse_var(
                "CLOUDENV_WORKER_BATCH_SIZE",
                defaults.batch_size,
                "must be a positive integer",
            )?,
            poll_interval: Duration::from_millis(parse_var(
                "CLOUDENV_POLL_INTERVAL_MS",
                u64::try_from(defaults.poll_interval.as_millis()).unwrap_or(u64::MAX),
                "must be a number of milliseconds",
            )?),
            visibility_timeout: Duration::from_secs(parse_var(
                "CLOUDENV_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
                "must be a number of seconds",
            )?),
            max_dequeue_count: parse_var(
                "CLOUDENV_MAX_DEQUEUE_COUNT",
                defaults.max_dequeue_count,
                "must be a positive integer",
            )?,
            ..defaults
        };
        if worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "CLOUDENV_WORKER_CONCURRENCY",
                "must be a positive integer",
            ));
        }

        let max_workflow_age = Duration::from_secs(parse_var(
            "CLOUDENV_MAX_WORKFLOW_AGE_SECS",
            DEFAULT_MAX_WORKFLOW_AGE.as_secs(),
            "must be a number of seconds",
        )?);

        let fault_retry = FaultRetryPolicy {
            max_attempts: parse_var(
                "CLOUDENV_FAULT_MAX_ATTEMPTS",
                FaultRetryPolicy::default().max_attempts,
                "must be a positive integer",
            )?,
            ..FaultRetryPolicy::default()
        };

        Ok(Self {
            region,
            database_url,
            worker,
            max_workflow_age,
            fault_retry,
        })
    }
}

/// Read `key`, falling back to `default` when unset.
pub fn parse_var<V: FromStr + ToString>(
    key: &'static str,
    default: V,
    expected: &'static str,
) -> Result<V, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, expected))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    const OPTIONAL: &[&str] = &[
        "CLOUDENV_DATABASE_URL",
        "CLOUDENV_WORKER_CONCURRENCY",
        "CLOUDENV_WORKER_BATCH_SIZE",
        "CLOUDENV_POLL_INTERVAL_MS",
        "CLOUDENV_VISIBILITY_TIMEOUT_SECS",
        "CLOUDENV_MAX_DEQUEUE_COUNT",
        "CLOUDENV_MAX_WORKFLOW_AGE_SECS",
        "CLOUDENV_FAULT_MAX_ATTEMPTS",
    ];

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CLOUDENV_REGION", "us");
        for key in OPTIONAL {
            guard.remove(key);
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.region, "us");
        assert!(config.database_url.is_none());
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_workflow_age, Duration::from_secs(3600));
        assert_eq!(config.fault_retry.max_attempts, 5);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CLOUDENV_REGION", "eu");
        guard.set("CLOUDENV_DATABASE_URL", "postgres://localhost/cloudenv");
        guard.set("CLOUDENV_WORKER_CONCURRENCY", "2");
        guard.set("CLOUDENV_VISIBILITY_TIMEOUT_SECS", "45");
        guard.set("CLOUDENV_FAULT_MAX_ATTEMPTS", "9");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/cloudenv"));
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.visibility_timeout, Duration::from_secs(45));
        assert_eq!(config.fault_retry.max_attempts, 9);
    }

    #[test]
    fn test_config_missing_region() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("CLOUDENV_REGION");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLOUDENV_REGION")));
    }

    #[test]
    fn test_config_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("CLOUDENV_REGION", "us");
        guard.set("CLOUDENV_WORKER_CONCURRENCY", "many");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CLOUDENV_WORKER_CONCURRENCY", _)));
    }
}
