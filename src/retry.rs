//! Fault tolerance: retry scheduling with exponential or linear backoff,
//! wrapped in a three-state circuit breaker.
//!
//! Every outbound request in this crate — the detector's initial probe,
//! every tier tester batch request, everything — is issued through a
//! [`RetryExecutor`]. The executor itself carries no knowledge of HTTP; it
//! retries whatever fallible async closure it is given and classifies
//! failures via [`DetectError`].

use crate::error::DetectError;
use crate::logging::{log_debug, log_error, log_warn};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Retry policy: schedule shape, retry eligibility, jitter.
///
/// `multiplier == 1.0` selects the linear schedule (`base * n`);
/// `multiplier > 1.0` selects the exponential schedule
/// (`base * multiplier^(n-1)`), both capped at `cap_delay`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier. `1.0` for linear, `>1.0` for exponential.
    pub multiplier: f64,
    /// Upper bound on any computed delay.
    pub cap_delay: Duration,
    /// Additional HTTP statuses (beyond the fixed 5xx/429 rules) that
    /// should be retried even though they're not otherwise classified as
    /// retryable.
    pub retryable_statuses: HashSet<u16>,
    /// Whether a timeout counts as retryable.
    pub retry_on_timeout: bool,
    /// Whether to add uniform random jitter in `[0, 0.1 * delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            cap_delay: Duration::from_secs(16),
            retryable_statuses: HashSet::new(),
            retry_on_timeout: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether `error` should trigger a retry under this policy, ignoring
    /// the attempt-count bound (the executor checks that separately).
    pub fn should_retry(&self, error: &DetectError) -> bool {
        match error {
            DetectError::RateLimitExceeded { .. } => true,
            DetectError::ServerError { .. } => true,
            DetectError::NetworkError { .. } => true,
            DetectError::Timeout { .. } => self.retry_on_timeout,
            DetectError::AuthError { .. } => false,
            DetectError::NotFound { .. } => false,
            DetectError::Other { status, .. } => {
                status.is_some_and(|s| self.retryable_statuses.contains(&s))
            }
            DetectError::Cancelled | DetectError::BreakerOpen | DetectError::Configuration { .. } => {
                false
            }
        }
    }

    /// Compute the delay before attempt `attempt + 1`, honoring a
    /// server-supplied `Retry-After` override when the triggering error
    /// carries a positive one.
    pub fn delay_for(&self, attempt: u32, error: &DetectError) -> Duration {
        if let DetectError::RateLimitExceeded {
            retry_after_seconds: Some(seconds),
            ..
        } = error
        {
            if *seconds > 0 {
                return Duration::from_secs(*seconds).min(self.cap_delay);
            }
        }

        let scheduled = if (self.multiplier - 1.0).abs() < f64::EPSILON {
            self.base_delay.as_secs_f64() * attempt as f64
        } else {
            self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1)
        };
        let capped = scheduled.min(self.cap_delay.as_secs_f64());

        if self.jitter {
            let jittered = capped + fastrand::f64() * 0.1 * capped;
            Duration::from_secs_f64(jittered)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive (in CLOSED) or total failures before tripping OPEN.
    pub failure_threshold: u32,
    /// How long OPEN is held before allowing a HALF_OPEN probe.
    pub recovery_timeout: Duration,
    /// Consecutive HALF_OPEN successes required to return to CLOSED.
    pub success_threshold: u32,
    /// Maximum concurrent HALF_OPEN probe calls admitted at once.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 5,
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; rejecting calls until the recovery timeout elapses.
    Open,
    /// Probing whether the target has recovered.
    HalfOpen,
}

/// Three-state circuit breaker. Mutated only through its owning
/// [`RetryExecutor`] (single-writer discipline); reads of [`CircuitBreaker::state`]
/// may be stale but are never torn.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    /// Build a breaker in the CLOSED state with the given thresholds.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_calls: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call should be let through right now. Also performs the
    /// OPEN → HALF_OPEN transition when the recovery timeout has elapsed.
    pub fn should_allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.maybe_enter_half_open(),
            CircuitState::HalfOpen => {
                if self.half_open_calls >= self.config.half_open_max_calls {
                    false
                } else {
                    self.half_open_calls += 1;
                    true
                }
            }
        }
    }

    fn maybe_enter_half_open(&mut self) -> bool {
        let Some(last_failure) = self.last_failure_time else {
            return false;
        };
        if last_failure.elapsed() >= self.config.recovery_timeout {
            log_debug!(circuit_breaker = "half_open", "circuit breaker attempting recovery");
            self.state = CircuitState::HalfOpen;
            self.half_open_calls = 1;
            true
        } else {
            false
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    log_debug!(circuit_breaker = "closed", "circuit breaker recovered");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.last_failure_time = None;
                    self.half_open_calls = 0;
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        match self.state {
            CircuitState::HalfOpen => {
                log_warn!(circuit_breaker = "reopened", "half-open probe failed");
                self.state = CircuitState::Open;
                self.success_count = 0;
                self.half_open_calls = 0;
            }
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    log_warn!(
                        circuit_breaker = "opened",
                        failure_count = self.failure_count,
                        failure_threshold = self.config.failure_threshold,
                        "circuit breaker opened due to repeated failures"
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Outcome of [`RetryExecutor::execute`]: either a successful response or
/// an exhausted-retries failure, with the attempt count and timing always
/// populated.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Attempts made, always `<= policy.max_attempts`.
    pub attempts: u32,
    /// The successful response, if `success`.
    pub final_response: Option<T>,
    /// The last error observed, if not `success`.
    pub final_error: Option<DetectError>,
    /// Total wall-clock time spent across all attempts and delays.
    pub total_elapsed: Duration,
    /// Human-readable log of each retry decision, in order.
    pub reasons: Vec<String>,
}

/// Retries a fallible async operation per [`RetryPolicy`], guarded by a
/// [`CircuitBreaker`]. Callers needing shared access wrap one instance in
/// a `tokio::sync::Mutex`, as the probe client does.
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    circuit_breaker: CircuitBreaker,
    per_call_timeout: Duration,
}

impl RetryExecutor {
    /// Build an executor from a retry policy, circuit breaker thresholds,
    /// and a per-call timeout (the `default 30s` operational cap of
    /// the concurrency model, kept separate from the data-model
    /// `RetryPolicy` itself).
    pub fn new(
        policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            circuit_breaker: CircuitBreaker::new(breaker_config),
            per_call_timeout,
        }
    }

    /// Current circuit breaker state, for diagnostics.
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Execute `operation`, retrying per policy until success, exhaustion,
    /// or a breaker rejection.
    pub async fn execute<F, Fut, T>(&mut self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, DetectError>>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        let mut last_error = None;
        let mut reasons = Vec::new();

        loop {
            if !self.circuit_breaker.should_allow_request() {
                last_error = Some(DetectError::breaker_open());
                reasons.push(format!("attempt {}: rejected, circuit breaker open", attempt + 1));
                break;
            }
            if attempt >= self.policy.max_attempts {
                break;
            }
            attempt += 1;

            let attempt_start = Instant::now();
            let outcome = tokio::time::timeout(self.per_call_timeout, operation()).await;

            match outcome {
                Ok(Ok(response)) => {
                    self.circuit_breaker.record_success();
                    log_debug!(
                        attempt = attempt,
                        duration_ms = attempt_start.elapsed().as_millis(),
                        "request succeeded"
                    );
                    return RetryOutcome {
                        success: true,
                        attempts: attempt,
                        final_response: Some(response),
                        final_error: None,
                        total_elapsed: start.elapsed(),
                        reasons,
                    };
                }
                Ok(Err(error)) => {
                    self.circuit_breaker.record_failure();
                    let should_retry = self.policy.should_retry(&error) && attempt < self.policy.max_attempts;
                    if should_retry {
                        let delay = self.policy.delay_for(attempt, &error);
                        reasons.push(format!(
                            "attempt {attempt}: {error} - retry in {:.1}s",
                            delay.as_secs_f64()
                        ));
                        last_error = Some(error);
                        sleep(delay).await;
                    } else {
                        reasons.push(format!("attempt {attempt}: {error} - not retrying"));
                        last_error = Some(error);
                        break;
                    }
                }
                Err(_elapsed) => {
                    let error = DetectError::timeout(self.per_call_timeout.as_secs());
                    self.circuit_breaker.record_failure();
                    let should_retry = self.policy.retry_on_timeout && attempt < self.policy.max_attempts;
                    if should_retry {
                        let delay = self.policy.delay_for(attempt, &error);
                        reasons.push(format!(
                            "attempt {attempt}: timeout - retry in {:.1}s",
                            delay.as_secs_f64()
                        ));
                        last_error = Some(error);
                        sleep(delay).await;
                    } else {
                        reasons.push(format!("attempt {attempt}: timeout - not retrying"));
                        last_error = Some(error);
                        break;
                    }
                }
            }
        }

        let final_error = last_error.unwrap_or_else(|| {
            DetectError::other(None, "maximum retry attempts exceeded")
        });
        log_error!(
            attempts = attempt,
            total_duration_ms = start.elapsed().as_millis(),
            error = %final_error,
            "request failed after all retry attempts"
        );
        RetryOutcome {
            success: false,
            attempts: attempt,
            final_response: None,
            final_error: Some(final_error),
            total_elapsed: start.elapsed(),
            reasons,
        }
    }
}
