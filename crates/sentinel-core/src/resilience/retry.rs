use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState, ErrorCategory,
    RETRYABLE_CATEGORIES, ResilienceResult, classify_error,
};

pub const COMPLETED_OPERATIONS_LIMIT: usize = 1000;

pub type RetryPredicate = Arc<dyn Fn(&CoreError, u32) -> bool + Send + Sync>;
pub type DelayFunction = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
    Custom,
}

#[derive(Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay used as a symmetric random offset.
    pub jitter: Option<f64>,
    pub retryable_errors: Vec<ErrorCategory>,
    pub retry_predicate: Option<RetryPredicate>,
    pub custom_delay: Option<DelayFunction>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: Some(0.1),
            retryable_errors: RETRYABLE_CATEGORIES.to_vec(),
            retry_predicate: None,
            custom_delay: None,
        }
    }
}

impl Debug for RetryConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("retryable_errors", &self.retryable_errors)
            .field("retry_predicate", &self.retry_predicate.is_some())
            .field("custom_delay", &self.custom_delay.is_some())
            .finish()
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = None;
        self
    }

    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&CoreError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_custom_delay(
        mut self,
        delay: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.strategy = BackoffStrategy::Custom;
        self.custom_delay = Some(Arc::new(delay));
        self
    }

    // attempt is 1-based; result is clamped, jitter not applied.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = self
                    .backoff_multiplier
                    .powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
                Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
                    .unwrap_or(self.max_delay)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Fibonacci => self.base_delay.saturating_mul(fibonacci(attempt)),
            BackoffStrategy::Custom => match &self.custom_delay {
                Some(delay) => delay(attempt),
                None => self.base_delay,
            },
        };
        delay.min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        match self.jitter {
            Some(fraction) => apply_jitter(delay, fraction),
            None => delay,
        }
    }

    fn should_retry(&self, error: &CoreError, category: ErrorCategory, attempt: u32) -> bool {
        if !self.retryable_errors.contains(&category) {
            return false;
        }
        match &self.retry_predicate {
            Some(predicate) => predicate(error, attempt),
            None => true,
        }
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut previous, mut current) = (0_u32, 1_u32);
    for _ in 1..n {
        let next = previous.saturating_add(current);
        previous = current;
        current = next;
    }
    current
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 || delay.is_zero() {
        return delay;
    }
    let seconds = delay.as_secs_f64();
    let spread = seconds * fraction;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::try_from_secs_f64((seconds + offset).max(0.0)).unwrap_or(delay)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub at: SystemTime,
    pub error: Option<String>,
    /// Delay slept before the next attempt; `None` for the final attempt.
    pub delay: Option<Duration>,
    pub succeeded: bool,
}

#[derive(Clone, Debug)]
pub struct RetryContext {
    pub operation: String,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub attempts: Vec<RetryAttempt>,
    pub config: RetryConfig,
    pub succeeded: bool,
}

impl RetryContext {
    fn new(operation: &str, config: RetryConfig) -> Self {
        Self {
            operation: operation.to_string(),
            started_at: SystemTime::now(),
            finished_at: None,
            attempts: Vec::new(),
            config,
            succeeded: false,
        }
    }

    fn record(&mut self, attempt: u32, error: Option<&CoreError>, delay: Option<Duration>) {
        self.attempts.push(RetryAttempt {
            attempt,
            at: SystemTime::now(),
            error: error.map(|error| error.message.clone()),
            delay,
            succeeded: error.is_none(),
        });
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub average_attempts: f64,
    pub circuit_breakers: usize,
    pub open_circuits: Vec<String>,
}

#[derive(Default)]
struct RetryState {
    breakers: HashMap<String, CircuitBreaker>,
    completed: VecDeque<RetryContext>,
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    total_attempts: u64,
}

pub struct RetryManager {
    default_config: RetryConfig,
    breaker_config: CircuitBreakerConfig,
    state: Mutex<RetryState>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default(), CircuitBreakerConfig::default())
    }
}

impl Debug for RetryManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("default_config", &self.default_config)
            .field("breaker_config", &self.breaker_config)
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    pub fn new(default_config: RetryConfig, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breaker_config,
            state: Mutex::new(RetryState::default()),
        }
    }

    pub fn default_config(&self) -> &RetryConfig {
        &self.default_config
    }

    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        config: Option<RetryConfig>,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let max_attempts = config.max_attempts.max(1);
        let mut context = RetryContext::new(operation_name, config.clone());
        let mut attempt = 0_u32;

        loop {
            attempt += 1;

            if let Err(error) = self.check_circuit(operation_name) {
                self.archive(context, false);
                return Err(error);
            }

            let error = match operation().await {
                Ok(value) => {
                    context.record(attempt, None, None);
                    self.on_success(operation_name);
                    self.archive(context, true);
                    if attempt > 1 {
                        tracing::info!(
                            operation = operation_name,
                            attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let category = classify_error(&error);
            let exhausted = attempt >= max_attempts;
            if exhausted || !config.should_retry(&error, category, attempt) {
                context.record(attempt, Some(&error), None);
                self.on_failure(operation_name);
                self.archive(context, false);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    category = ?category,
                    exhausted,
                    error = %error,
                    "operation failed"
                );
                return Err(error.attribute(None, Some(operation_name)));
            }

            let delay = config.delay_for(attempt);
            context.record(attempt, Some(&error), Some(delay));
            tracing::debug!(
                operation = operation_name,
                attempt,
                category = ?category,
                delay_ms = delay.as_millis() as u64,
                "retrying operation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn get_circuit_breaker_status(&self, operation_name: &str) -> Option<CircuitBreakerStatus> {
        self.lock_state()
            .breakers
            .get(operation_name)
            .map(CircuitBreaker::status)
    }

    pub fn reset_circuit_breaker(&self, operation_name: &str) -> bool {
        let mut state = self.lock_state();
        match state.breakers.get_mut(operation_name) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(operation = operation_name, "circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn get_metrics(&self) -> RetryMetrics {
        let state = self.lock_state();
        let mut open_circuits: Vec<String> = state
            .breakers
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open_circuits.sort();

        let average_attempts = if state.total_operations == 0 {
            0.0
        } else {
            state.total_attempts as f64 / state.total_operations as f64
        };

        RetryMetrics {
            total_operations: state.total_operations,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            average_attempts,
            circuit_breakers: state.breakers.len(),
            open_circuits,
        }
    }

    pub fn recent_operations(&self, limit: usize) -> Vec<RetryContext> {
        self.lock_state()
            .completed
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn check_circuit(&self, operation_name: &str) -> ResilienceResult<()> {
        let mut state = self.lock_state();
        let Some(breaker) = state.breakers.get_mut(operation_name) else {
            return Ok(());
        };
        let was_open = breaker.state() == CircuitState::Open;
        if breaker.allow_request() {
            if was_open {
                tracing::info!(operation = operation_name, "circuit breaker half-open");
            }
            return Ok(());
        }
        Err(CoreError::new(
            CoreErrorKind::CircuitOpen,
            format!("Circuit breaker is open for operation: {operation_name}"),
        )
        .with_operation(operation_name))
    }

    fn on_success(&self, operation_name: &str) {
        let mut state = self.lock_state();
        if let Some(breaker) = state.breakers.get_mut(operation_name) {
            if breaker.state() != CircuitState::Closed {
                tracing::info!(operation = operation_name, "circuit breaker closed");
            }
            breaker.record_success();
        }
    }

    fn on_failure(&self, operation_name: &str) {
        let mut state = self.lock_state();
        let breaker = state
            .breakers
            .entry(operation_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        let was_open = breaker.state() == CircuitState::Open;
        breaker.record_failure();
        if !was_open && breaker.state() == CircuitState::Open {
            tracing::warn!(
                operation = operation_name,
                consecutive_failures = breaker.consecutive_failures(),
                "circuit breaker opened"
            );
        }
    }

    fn archive(&self, mut context: RetryContext, succeeded: bool) {
        context.succeeded = succeeded;
        context.finished_at = Some(SystemTime::now());

        let mut state = self.lock_state();
        state.total_operations = state.total_operations.saturating_add(1);
        state.total_attempts = state
            .total_attempts
            .saturating_add(context.attempts.len() as u64);
        if succeeded {
            state.successful_operations = state.successful_operations.saturating_add(1);
        } else {
            state.failed_operations = state.failed_operations.saturating_add(1);
        }
        state.completed.push_back(context);
        while state.completed.len() > COMPLETED_OPERATIONS_LIMIT {
            state.completed.pop_front();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffStrategy, RetryConfig, fibonacci};

    fn config(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            strategy,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: None,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn exponential_delays_double() {
        let config = config(BackoffStrategy::Exponential);
        assert_eq!(config.delay_for(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn linear_fixed_and_fibonacci_delays() {
        let linear = config(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_millis(3000));

        let fixed = config(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(4), Duration::from_millis(1000));

        let fib = config(BackoffStrategy::Fibonacci);
        let delays: Vec<_> = (1..=6).map(|attempt| fib.delay_for(attempt)).collect();
        assert_eq!(
            delays,
            [1, 1, 2, 3, 5, 8].map(|n| Duration::from_millis(1000 * n))
        );
    }

    #[test]
    fn delays_are_clamped_to_max_delay() {
        let config = config(BackoffStrategy::Exponential);
        assert_eq!(config.delay_for(10), Duration::from_millis(30_000));
    }

    #[test]
    fn custom_strategy_uses_delay_function() {
        let config = config(BackoffStrategy::Fixed)
            .with_custom_delay(|attempt| Duration::from_millis(u64::from(attempt) * 7));
        assert_eq!(config.delay_for(3), Duration::from_millis(21));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let config = RetryConfig {
            jitter: Some(0.1),
            ..config(BackoffStrategy::Fixed)
        };
        for _ in 0..100 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn fibonacci_sequence_starts_at_one() {
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(2), 1);
        assert_eq!(fibonacci(7), 13);
    }
}
