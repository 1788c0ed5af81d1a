use crate::error::DetectError;
use crate::retry::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryExecutor, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        cap_delay: Duration::from_millis(20),
        retryable_statuses: Default::default(),
        retry_on_timeout: true,
        jitter: false,
    }
}

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(50),
        success_threshold: 2,
        half_open_max_calls: 5,
    }
}

#[test]
fn policy_defaults_match_the_documented_schedule() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.base_delay, Duration::from_secs(1));
    assert_eq!(policy.multiplier, 2.0);
    assert_eq!(policy.cap_delay, Duration::from_secs(16));
    assert!(policy.jitter);
}

#[test]
fn should_retry_follows_the_fixed_retryable_table() {
    let policy = fast_policy();
    assert!(policy.should_retry(&DetectError::rate_limit_exceeded(None, None)));
    assert!(policy.should_retry(&DetectError::server_error(503, "x")));
    assert!(policy.should_retry(&DetectError::network_error("x", None)));
    assert!(!policy.should_retry(&DetectError::auth_error(401, "x")));
    assert!(!policy.should_retry(&DetectError::not_found("/p")));
}

#[test]
fn retry_after_overrides_the_computed_delay() {
    let policy = RetryPolicy {
        cap_delay: Duration::from_secs(60),
        ..fast_policy()
    };
    let error = DetectError::rate_limit_exceeded(Some(5), None);
    assert_eq!(policy.delay_for(1, &error), Duration::from_secs(5));
}

#[test]
fn retry_after_is_still_capped() {
    let policy = fast_policy();
    let error = DetectError::rate_limit_exceeded(Some(3600), None);
    assert_eq!(policy.delay_for(1, &error), policy.cap_delay);
}

#[test]
fn exponential_schedule_doubles_each_attempt() {
    let policy = RetryPolicy {
        base_delay: Duration::from_secs(1),
        multiplier: 2.0,
        cap_delay: Duration::from_secs(100),
        jitter: false,
        ..fast_policy()
    };
    let error = DetectError::server_error(503, "x");
    assert_eq!(policy.delay_for(1, &error), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2, &error), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3, &error), Duration::from_secs(4));
}

#[test]
fn breaker_opens_after_failure_threshold_and_rejects_while_open() {
    let mut breaker = CircuitBreaker::new(fast_breaker());
    assert_eq!(breaker.state(), CircuitState::Closed);
    for _ in 0..3 {
        assert!(breaker.should_allow_request());
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.should_allow_request());
}

#[tokio::test]
async fn breaker_half_opens_after_recovery_and_closes_after_success_threshold() {
    let mut breaker = CircuitBreaker::new(fast_breaker());
    for _ in 0..3 {
        breaker.should_allow_request();
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(breaker.should_allow_request());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success is below success_threshold");
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn half_open_failure_reopens_the_breaker() {
    let mut breaker = CircuitBreaker::new(fast_breaker());
    for _ in 0..3 {
        breaker.should_allow_request();
        breaker.record_failure();
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(breaker.should_allow_request());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn executor_retries_until_success_and_counts_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut executor = RetryExecutor::new(fast_policy(), fast_breaker(), Duration::from_secs(5));

    let calls_clone = Arc::clone(&calls);
    let outcome = executor
        .execute(move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(DetectError::server_error(503, "still failing"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.final_response, Some(42));
}

#[tokio::test]
async fn executor_reports_failure_after_exhausting_attempts() {
    // fast_breaker's failure_threshold (3) is lower than fast_policy's
    // max_attempts (4), so the breaker trips open on the third failure and
    // rejects the fourth attempt outright rather than letting the policy
    // exhaust its own schedule.
    let mut executor = RetryExecutor::new(fast_policy(), fast_breaker(), Duration::from_secs(5));

    let outcome = executor
        .execute(|| async { Err::<u32, _>(DetectError::server_error(503, "down")) })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3, "breaker opens after 3 failures, pre-empting the 4th attempt");
    assert!(matches!(outcome.final_error, Some(DetectError::BreakerOpen)));
}

#[tokio::test]
async fn executor_exhausts_the_full_schedule_when_the_breaker_never_trips() {
    let lenient_breaker = CircuitBreakerConfig {
        failure_threshold: 10,
        ..fast_breaker()
    };
    let mut executor = RetryExecutor::new(fast_policy(), lenient_breaker, Duration::from_secs(5));

    let outcome = executor
        .execute(|| async { Err::<u32, _>(DetectError::server_error(503, "down")) })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 4, "attempts must stay <= max_attempts");
    assert!(matches!(outcome.final_error, Some(DetectError::ServerError { status: 503, .. })));
}

#[tokio::test]
async fn non_retryable_error_stops_after_one_attempt() {
    let mut executor = RetryExecutor::new(fast_policy(), fast_breaker(), Duration::from_secs(5));

    let outcome = executor
        .execute(|| async { Err::<u32, _>(DetectError::auth_error(401, "bad key")) })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
}
