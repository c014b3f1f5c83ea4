//! Serializable settings for every orchestration component.
//!
//! Durations are plain millisecond counts so documents stay readable. Each
//! section converts into the runtime config of the component it describes;
//! missing fields fall back to the component defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::SentinelConfig;
use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::{ConcurrencyConfig, JobManagerConfig, ResourceLimits};
use crate::resilience::{
    BackoffStrategy, CircuitBreakerConfig, DEFAULT_REQUESTS_PER_MINUTE, ErrorCategory,
    RETRYABLE_CATEGORIES, RetryConfig,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelSettings {
    pub concurrency: ConcurrencySettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limit: RateLimitSettings,
    pub job_manager: JobManagerSettings,
    pub discovery: DiscoverySettings,
}

impl SentinelSettings {
    pub fn from_json_str(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("invalid sentinel settings: {error}"),
            )
            .with_operation("load_settings")
        })
    }

    pub fn concurrency_config(&self) -> ConcurrencyConfig {
        self.concurrency.to_config()
    }

    /// Runtime config for the discovery service, assembled from the retry,
    /// breaker, rate limit, job manager and discovery sections.
    pub fn sentinel_config(&self) -> SentinelConfig {
        SentinelConfig {
            max_concurrent_jobs: self.discovery.max_concurrent_jobs.max(1),
            health_check_timeout: Duration::from_millis(self.discovery.health_check_timeout_ms),
            default_requests_per_minute: self.rate_limit.default_requests_per_minute,
            retry: self.retry.to_config(),
            circuit_breaker: self.circuit_breaker.to_config(),
            job_manager: self.job_manager.to_config(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub max_concurrent_jobs: usize,
    pub max_jobs_per_domain: usize,
    pub job_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub completed_jobs_limit: usize,
    pub shutdown_grace_ms: u64,
    pub max_total_jobs: Option<usize>,
    pub max_memory_bytes: Option<u64>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self::from(&ConcurrencyConfig::default())
    }
}

impl From<&ConcurrencyConfig> for ConcurrencySettings {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_jobs_per_domain: config.max_jobs_per_domain,
            job_timeout_ms: duration_to_ms(config.default_timeout),
            tick_interval_ms: duration_to_ms(config.tick_interval),
            completed_jobs_limit: config.completed_jobs_limit,
            shutdown_grace_ms: duration_to_ms(config.shutdown_grace),
            max_total_jobs: config.resource_limits.max_total_jobs,
            max_memory_bytes: config.resource_limits.max_memory_bytes,
        }
    }
}

impl ConcurrencySettings {
    pub fn to_config(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_jobs_per_domain: self.max_jobs_per_domain,
            default_timeout: Duration::from_millis(self.job_timeout_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            completed_jobs_limit: self.completed_jobs_limit,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            resource_limits: ResourceLimits {
                max_total_jobs: self.max_total_jobs,
                max_memory_bytes: self.max_memory_bytes,
            },
        }
    }
}

/// Retry policy. Predicates and custom delay functions cannot be expressed
/// here; attach them to the converted [`RetryConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    /// Fraction of the delay; `None` disables jitter.
    pub jitter: Option<f64>,
    pub retryable_errors: Vec<ErrorCategory>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: Some(0.1),
            retryable_errors: RETRYABLE_CATEGORIES.to_vec(),
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter.filter(|fraction| *fraction > 0.0),
            retryable_errors: self.retryable_errors.clone(),
            ..RetryConfig::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_requests_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerSettings {
    pub history_limit: usize,
    pub default_wait_estimate_ms: u64,
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        let config = JobManagerConfig::default();
        Self {
            history_limit: config.history_limit,
            default_wait_estimate_ms: duration_to_ms(config.default_wait_estimate),
        }
    }
}

impl JobManagerSettings {
    pub fn to_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            history_limit: self.history_limit,
            default_wait_estimate: Duration::from_millis(self.default_wait_estimate_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Plugins run concurrently per discovery batch.
    pub max_concurrent_jobs: usize,
    pub health_check_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            health_check_timeout_ms: 5000,
        }
    }
}

fn duration_to_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_component_defaults() {
        let settings = SentinelSettings::from_json_str("{}").expect("parse");
        assert_eq!(settings, SentinelSettings::default());

        let concurrency = settings.concurrency_config();
        assert_eq!(concurrency.max_concurrent_jobs, 10);
        assert_eq!(concurrency.max_jobs_per_domain, 2);
        assert_eq!(concurrency.default_timeout, Duration::from_secs(300));

        let sentinel = settings.sentinel_config();
        assert_eq!(sentinel.max_concurrent_jobs, 3);
        assert_eq!(sentinel.default_requests_per_minute, 60);
        assert_eq!(sentinel.retry.max_attempts, 3);
        assert_eq!(sentinel.circuit_breaker.failure_threshold, 5);
        assert_eq!(sentinel.job_manager.history_limit, 1000);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let settings = SentinelSettings::from_json_str(
            r#"{
                "concurrency": { "max_concurrent_jobs": 4, "max_total_jobs": 50 },
                "retry": { "strategy": "fibonacci", "jitter": null, "base_delay_ms": 250 },
                "circuit_breaker": { "reset_timeout_ms": 1500 }
            }"#,
        )
        .expect("parse");

        let concurrency = settings.concurrency_config();
        assert_eq!(concurrency.max_concurrent_jobs, 4);
        assert_eq!(concurrency.max_jobs_per_domain, 2);
        assert_eq!(concurrency.resource_limits.max_total_jobs, Some(50));

        let retry = settings.retry.to_config();
        assert_eq!(retry.strategy, BackoffStrategy::Fibonacci);
        assert_eq!(retry.jitter, None);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_millis(30_000));

        let breaker = settings.circuit_breaker.to_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn malformed_document_is_invalid_input() {
        let error = SentinelSettings::from_json_str("{ \"retry\": 3 }").expect_err("reject");
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.operation.as_deref(), Some("load_settings"));
    }
}
