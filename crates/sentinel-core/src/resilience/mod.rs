//! Admission control and failure handling shared by every discovery run.

pub mod circuit_breaker;
pub mod classify;
pub mod rate_limiter;
pub mod retry;

use crate::models::CoreError;

pub type ResilienceResult<T> = Result<T, CoreError>;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use classify::{ErrorCategory, RETRYABLE_CATEGORIES, classify_error};
pub use rate_limiter::{DEFAULT_REQUESTS_PER_MINUTE, RateLimitInfo, RateLimiter, domain_of};
pub use retry::{
    BackoffStrategy, DelayFunction, RetryAttempt, RetryConfig, RetryContext, RetryManager,
    RetryMetrics, RetryPredicate,
};
