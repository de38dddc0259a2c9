//! Scheduler configuration.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `SEDIMENT__CLAIM_LEASE_MS`.
pub const ENV_PREFIX: &str = "SEDIMENT";

/// Configuration for a scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name of this instance, used as claim owner. Must differ between
    /// replicas sharing a claim store.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// How long a claim stays reserved before another instance may take it.
    #[serde(default = "default_claim_lease_ms")]
    pub claim_lease_ms: u64,
    /// How long a job's executor may go without renewing its lease before
    /// another instance resumes the job.
    #[serde(default = "default_job_lease_ms")]
    pub job_lease_ms: u64,
    /// Period of lease renewal and of the scan for jobs nobody executes.
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
    /// Period of the idle worker pool check.
    #[serde(default = "default_scale_down_check_interval_ms")]
    pub scale_down_check_interval_ms: u64,
    /// Scale-down threshold for pipelines that do not set one.
    #[serde(default)]
    pub default_scale_down_threshold_ms: Option<u64>,
    /// Capacity of the in-process event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_instance_id() -> String {
    "sediment-scheduler".to_string()
}

fn default_claim_lease_ms() -> u64 {
    30_000
}

fn default_job_lease_ms() -> u64 {
    30_000
}

fn default_recovery_interval_ms() -> u64 {
    5_000
}

fn default_scale_down_check_interval_ms() -> u64 {
    1_000
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            claim_lease_ms: default_claim_lease_ms(),
            job_lease_ms: default_job_lease_ms(),
            recovery_interval_ms: default_recovery_interval_ms(),
            scale_down_check_interval_ms: default_scale_down_check_interval_ms(),
            default_scale_down_threshold_ms: None,
            event_buffer: default_event_buffer(),
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `SEDIMENT__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn with_job_lease(mut self, lease: Duration) -> Self {
        self.job_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_scale_down_check_interval(mut self, interval: Duration) -> Self {
        self.scale_down_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_default_scale_down_threshold(mut self, threshold: Duration) -> Self {
        self.default_scale_down_threshold_ms = Some(threshold.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_millis(self.job_lease_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }

    pub fn scale_down_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_down_check_interval_ms.max(1))
    }
}

/// Bounded exponential backoff for infrastructure calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: SchedulerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.instance_id, "sediment-scheduler");
        assert_eq!(config.claim_lease_ms, 30_000);
        assert_eq!(config.job_lease_ms, 30_000);
        assert_eq!(config.recovery_interval(), Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
instance_id: scheduler-b
default_scale_down_threshold_ms: 60000
retry:
  max_attempts: 2
logging:
  level: debug
  json: true
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.instance_id, "scheduler-b");
        assert_eq!(config.default_scale_down_threshold_ms, Some(60_000));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_builders() {
        let config = SchedulerConfig::default()
            .with_instance_id("a")
            .with_claim_lease(Duration::from_secs(2));
        assert_eq!(config.instance_id, "a");
        assert_eq!(config.claim_lease(), Duration::from_secs(2));
    }
}
