//! Configuration for the payhook service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use payhook_pipeline::{PipelineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "payhook.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`payhook.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of concurrent pipeline workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,

    /// Handler timeout in seconds for processors without their own.
    ///
    /// Environment variable: `HANDLER_TIMEOUT_SECONDS`
    #[serde(default = "default_handler_timeout", alias = "HANDLER_TIMEOUT_SECONDS")]
    pub handler_timeout_seconds: u64,

    /// Maximum handler invocations per event, including the first.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,

    /// Cap on any retry delay, in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    /// Upper bound of the random jitter, in milliseconds. Unset uses the
    /// base delay; zero disables it.
    ///
    /// Environment variable: `RETRY_MAX_JITTER_MS`
    #[serde(default, alias = "RETRY_MAX_JITTER_MS")]
    pub retry_max_jitter_ms: Option<u64>,

    /// Fixed jitter seed, for reproducible schedules.
    ///
    /// Environment variable: `RETRY_SEED`
    #[serde(default, alias = "RETRY_SEED")]
    pub retry_seed: Option<u64>,

    /// Time to wait for in-flight handlers on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    /// Interval between metrics log lines, in seconds.
    ///
    /// Environment variable: `METRICS_INTERVAL_SECONDS`
    #[serde(default = "default_metrics_interval", alias = "METRICS_INTERVAL_SECONDS")]
    pub metrics_interval_seconds: u64,

    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `payhook.toml`, and environment
    /// variable overrides, then validates it.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the pipeline engine configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            worker_count: self.worker_pool_size,
            default_timeout: Duration::from_secs(self.handler_timeout_seconds),
            retry: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            ..PipelineConfig::default()
        }
    }

    /// Converts to the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_jitter: self.retry_max_jitter_ms.map(Duration::from_millis),
            seed: self.retry_seed,
        }
    }

    /// Interval between metrics reports.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_seconds.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.handler_timeout_seconds == 0 {
            anyhow::bail!("handler_timeout_seconds must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_count(),
            handler_timeout_seconds: default_handler_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_max_jitter_ms: None,
            retry_seed: None,
            shutdown_timeout_seconds: default_shutdown_timeout(),
            metrics_interval_seconds: default_metrics_interval(),
            rust_log: default_log_level(),
        }
    }
}

fn default_worker_count() -> usize {
    payhook_pipeline::DEFAULT_WORKER_COUNT
}

fn default_handler_timeout() -> u64 {
    payhook_pipeline::DEFAULT_TIMEOUT_SECONDS
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info,payhook=debug".to_string()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        vars: Vec<String>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, vars: Vec::new(), originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            if !self.vars.contains(&key.to_string()) {
                self.originals.insert(key.to_string(), env::var(key).ok());
                self.vars.push(key.to_string());
            }
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for var in &self.vars {
                match self.originals.get(var) {
                    Some(Some(value)) => env::set_var(var, value),
                    Some(None) => env::remove_var(var),
                    None => {},
                }
            }
        }
    }

    #[test]
    fn default_config_matches_pipeline_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let pipeline = config.to_pipeline_config();
        assert_eq!(pipeline, PipelineConfig::default());
    }

    #[test]
    fn env_overrides_are_applied() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("WORKER_POOL_SIZE", "16");
        guard.set_var("HANDLER_TIMEOUT_SECONDS", "5");
        guard.set_var("MAX_ATTEMPTS", "7");
        guard.set_var("RETRY_BASE_DELAY_MS", "250");
        guard.set_var("RETRY_MAX_DELAY_MS", "10000");
        guard.set_var("RETRY_MAX_JITTER_MS", "0");
        guard.set_var("RETRY_SEED", "42");
        guard.set_var("SHUTDOWN_TIMEOUT_SECONDS", "12");

        let config = Config::load().expect("config should load with env overrides");

        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.retry_seed, Some(42));

        let pipeline = config.to_pipeline_config();
        assert_eq!(pipeline.worker_count, 16);
        assert_eq!(pipeline.default_timeout, Duration::from_secs(5));
        assert_eq!(pipeline.shutdown_timeout, Duration::from_secs(12));
        assert_eq!(pipeline.retry.base_delay, Duration::from_millis(250));
        assert_eq!(pipeline.retry.max_delay, Duration::from_secs(10));
        assert_eq!(pipeline.retry.max_jitter, Some(Duration::ZERO));
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn jitter_defaults_to_configured_base_delay() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("RETRY_BASE_DELAY_MS", "100");

        let config = Config::load().expect("config should load with base delay override");
        assert_eq!(config.retry_max_jitter_ms, None);

        let retry = config.to_retry_policy();
        assert_eq!(retry.max_jitter, None);
        assert_eq!(retry.jitter_ceiling(), Duration::from_millis(100));
    }

    #[test]
    fn invalid_env_values_fail_to_load() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("WORKER_POOL_SIZE", "0");
        assert!(Config::load().is_err());

        guard.set_var("WORKER_POOL_SIZE", "not-a-number");
        assert!(Config::load().is_err());
    }

    #[test]
    fn invalid_config_validation_fails() {
        let mut config = Config { worker_pool_size: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { max_attempts: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { handler_timeout_seconds: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config =
            Config { retry_base_delay_ms: 5000, retry_max_delay_ms: 1000, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn metrics_interval_is_never_zero() {
        let config = Config { metrics_interval_seconds: 0, ..Config::default() };
        assert_eq!(config.metrics_interval(), Duration::from_secs(1));
    }
}
