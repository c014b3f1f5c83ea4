//! Consecutive-failure circuit breaker.
//!
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast until `next_attempt`
//! - HalfOpen: the next call is let through; success closes, failure reopens

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial request is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<SystemTime>,
    /// Remaining open time; `None` unless the circuit is open.
    pub retry_after: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<SystemTime>,
    next_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            next_attempt: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns whether a call may proceed, moving an open circuit to
    /// half-open once its timeout has elapsed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = self
                    .next_attempt
                    .is_none_or(|next_attempt| Instant::now() >= next_attempt);
                if ready {
                    self.state = CircuitState::HalfOpen;
                }
                ready
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.next_attempt = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(SystemTime::now());

        let should_open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            self.state = CircuitState::Open;
            self.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.next_attempt = None;
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let retry_after = match (self.state, self.next_attempt) {
            (CircuitState::Open, Some(next_attempt)) => {
                Some(next_attempt.saturating_duration_since(Instant::now()))
            }
            _ => None,
        };
        CircuitBreakerStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure: self.last_failure,
            retry_after,
        }
    }
}
