use std::time::Duration;

use sentinel_core::models::CoreErrorKind;
use sentinel_core::resilience::{RateLimiter, domain_of};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn domains_have_independent_buckets() {
    let limiter = RateLimiter::new(60);
    limiter.set_domain_limit("grants.example.org", 2).unwrap();

    assert!(limiter.consume_token("grants.example.org"));
    assert!(limiter.consume_token("grants.example.org"));
    assert!(!limiter.consume_token("grants.example.org"));
    assert!(!limiter.can_make_request("grants.example.org"));

    assert!(limiter.can_make_request("jobs.example.org"));
    let info = limiter.get_rate_limit_info("jobs.example.org");
    assert_eq!(info.requests_per_minute, 60);
    assert_eq!(info.available_tokens, 60);
    assert_eq!(info.time_until_next_token, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn can_make_request_does_not_consume() {
    let limiter = RateLimiter::new(1);

    for _ in 0..5 {
        assert!(limiter.can_make_request("example.org"));
    }
    assert!(limiter.consume_token("example.org"));
    assert!(!limiter.can_make_request("example.org"));
}

#[tokio::test(start_paused = true)]
async fn wait_for_availability_sleeps_until_next_token() {
    let limiter = RateLimiter::new(60);
    limiter.set_domain_limit("slow.example.org", 2).unwrap();
    assert!(limiter.consume_token("slow.example.org"));
    assert!(limiter.consume_token("slow.example.org"));

    let info = limiter.get_rate_limit_info("slow.example.org");
    assert_eq!(info.available_tokens, 0);
    assert!(info.time_until_next_token > Duration::from_secs(29));
    assert!(info.time_until_next_token <= Duration::from_secs(30) + Duration::from_millis(1));

    let started = Instant::now();
    limiter.wait_for_availability("slow.example.org").await;
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(29_900), "waited {waited:?}");
    assert!(waited < Duration::from_secs(31), "waited {waited:?}");
    assert!(limiter.consume_token("slow.example.org"));
}

#[tokio::test(start_paused = true)]
async fn acquire_and_execute_consume_tokens_in_order() {
    let limiter = RateLimiter::new(60);
    limiter.set_domain_limit("api.example.org", 1).unwrap();

    let first = limiter.execute("api.example.org", || async { 1 }).await;
    assert_eq!(first, 1);

    let started = Instant::now();
    let second = limiter.execute("api.example.org", || async { 2 }).await;
    assert_eq!(second, 2);
    assert!(started.elapsed() >= Duration::from_millis(59_900));
    assert!(!limiter.can_make_request("api.example.org"));
}

#[tokio::test(start_paused = true)]
async fn lowering_a_limit_caps_stored_tokens() {
    let limiter = RateLimiter::new(60);
    assert!(limiter.consume_token("example.org"));

    limiter.set_domain_limit("example.org", 5).unwrap();
    let info = limiter.get_rate_limit_info("example.org");
    assert_eq!(info.capacity, 5);
    assert_eq!(info.available_tokens, 5);
}

#[test]
fn zero_limit_is_rejected() {
    let limiter = RateLimiter::default();
    let error = limiter.set_domain_limit("example.org", 0).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[test]
fn urls_map_to_their_host() {
    assert_eq!(
        domain_of("https://www.Example.org/grants?page=2").as_deref(),
        Some("www.example.org")
    );
    assert_eq!(domain_of("not a url"), None);
}
