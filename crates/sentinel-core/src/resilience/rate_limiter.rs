
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{CoreError, CoreErrorKind};
use crate::resilience::ResilienceResult;

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

// Absorbs float drift after sleeping exactly the computed refill time.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitInfo {
    pub domain: String,
    pub requests_per_minute: u32,
    pub capacity: u32,
    pub available_tokens: u32,
    pub time_until_next_token: Duration,
}

#[derive(Debug)]
struct TokenBucket {
    requests_per_minute: u32,
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(requests_per_minute);
        Self {
            requests_per_minute,
            capacity,
            tokens: capacity,
            refill_per_second: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens + TOKEN_EPSILON >= 1.0
    }

    fn take(&mut self) -> bool {
        if !self.has_token() {
            return false;
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        true
    }

    fn time_until_token(&self) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    default_requests_per_minute: u32,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_MINUTE)
    }
}

impl RateLimiter {
    pub fn new(default_requests_per_minute: u32) -> Self {
        Self {
            default_requests_per_minute: default_requests_per_minute.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_requests_per_minute(&self) -> u32 {
        self.default_requests_per_minute
    }

    pub fn can_make_request(&self, domain: &str) -> bool {
        self.with_bucket(domain, |bucket| bucket.has_token())
    }

    pub fn consume_token(&self, domain: &str) -> bool {
        let consumed = self.with_bucket(domain, TokenBucket::take);
        if !consumed {
            tracing::debug!(domain, "rate limit reached");
        }
        consumed
    }

    // Does not consume the token.
    pub async fn wait_for_availability(&self, domain: &str) {
        loop {
            let wait = self.with_bucket(domain, |bucket| bucket.time_until_token());
            if wait.is_zero() {
                return;
            }
            tracing::trace!(domain, wait_ms = wait.as_millis() as u64, "waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn acquire(&self, domain: &str) {
        loop {
            let wait = self.with_bucket(domain, |bucket| {
                if bucket.take() {
                    Duration::ZERO
                } else {
                    bucket.time_until_token().max(Duration::from_millis(1))
                }
            });
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn execute<F, Fut, T>(&self, domain: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(domain).await;
        operation().await
    }

    pub fn set_domain_limit(&self, domain: &str, requests_per_minute: u32) -> ResilienceResult<()> {
        if requests_per_minute == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("rate limit for domain '{domain}' must be at least 1 request per minute"),
            ));
        }

        let now = Instant::now();
        let mut buckets = self.lock_buckets();
        let mut bucket = TokenBucket::new(requests_per_minute, now);
        if let Some(previous) = buckets.get_mut(domain) {
            previous.refill(now);
            bucket.tokens = previous.tokens.min(bucket.capacity);
        }
        buckets.insert(domain.to_string(), bucket);
        tracing::debug!(domain, requests_per_minute, "domain rate limit configured");
        Ok(())
    }

    pub fn get_rate_limit_info(&self, domain: &str) -> RateLimitInfo {
        self.with_bucket(domain, |bucket| RateLimitInfo {
            domain: domain.to_string(),
            requests_per_minute: bucket.requests_per_minute,
            capacity: bucket.requests_per_minute,
            available_tokens: (bucket.tokens + TOKEN_EPSILON).floor() as u32,
            time_until_next_token: bucket.time_until_token(),
        })
    }

    fn with_bucket<R>(&self, domain: &str, operation: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let now = Instant::now();
        let mut buckets = self.lock_buckets();
        let bucket = buckets
            .entry(domain.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_requests_per_minute, now));
        bucket.refill(now);
        operation(bucket)
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host portion of `url`, lower-cased. `None` for unparsable or host-less URLs.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::domain_of;

    #[test]
    fn domain_is_extracted_from_urls() {
        assert_eq!(
            domain_of("https://Grants.Example.org/calls?id=1").as_deref(),
            Some("grants.example.org")
        );
        assert_eq!(domain_of("not a url"), None);
    }
}
