//! Drives one tier's ramp test: issue a batch of requests spaced evenly
//! across the tier's window, watch for a 429, and either escalate the
//! rate or stop once a limit is observed, time runs out, or the caller
//! cancels.
//!
//! Every request in a batch goes through the fault tolerance layer, which
//! in turn goes through the rotator (when one is supplied) — the same
//! call order the detector's initial probe uses.

use crate::error::DetectError;
use crate::header_analyzer::HeaderAnalyzer;
use crate::logging::{log_debug, log_info};
use crate::models::{DetectionSource, RateLimit, TierResult, TierSpec};
use crate::probe::{ProbeRequest, ProbeResponse, ProbeSender};
use crate::retry::RetryExecutor;
use crate::rotator::EndpointRotator;
use governor::{Quota, RateLimiter};
use reqwest::header::HeaderMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Cooperative cancellation flag shared between a caller and an
/// in-flight tier test (or a whole detection run). Cloning shares the
/// same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Observers see this within one in-flight
    /// request round-trip.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Maximum time to sleep for a server-supplied `Retry-After` safety
/// guard after observing the limiting 429.
const MAX_BACKOFF_GUARD: Duration = Duration::from_secs(10);

async fn issue_probe(
    sender: &dyn ProbeSender,
    rotator: Option<&Mutex<EndpointRotator>>,
    base_url: &str,
    default_path: &str,
    headers: &HeaderMap,
    latencies: &Mutex<Vec<Duration>>,
) -> Result<ProbeResponse, DetectError> {
    let path = match rotator {
        Some(rotator) => rotator.lock().await.next()?,
        None => default_path.to_string(),
    };
    let url = format!("{base_url}{path}");
    let request = ProbeRequest::get(url, headers.clone());

    let start = Instant::now();
    let result = sender.send(&request).await;
    let elapsed = start.elapsed();
    latencies.lock().await.push(elapsed);

    if let Some(rotator) = rotator {
        let (status, transport_failed, response_headers) = match &result {
            Ok(response) => (Some(response.status), false, Some(response.headers.clone())),
            Err(DetectError::NetworkError { .. }) => (None, true, None),
            Err(DetectError::RateLimitExceeded { headers, .. }) => (Some(429), false, headers.clone()),
            Err(DetectError::ServerError { status, .. }) => (Some(*status), false, None),
            Err(DetectError::AuthError { status, .. }) => (Some(*status), false, None),
            Err(DetectError::NotFound { .. }) => (Some(404), false, None),
            Err(DetectError::Other { status, .. }) => (*status, false, None),
            Err(_) => (None, false, None),
        };
        rotator
            .lock()
            .await
            .record_outcome(&path, status, elapsed, transport_failed, response_headers.as_ref());
    }

    result
}

fn pacing_limiter(interval: Duration) -> RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock> {
    let quota = Quota::with_period(interval).unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()));
    RateLimiter::direct(quota)
}

fn mean(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = durations.iter().sum();
    total / durations.len() as u32
}

/// Run a full ramp test for `spec` against `base_url`, using `headers` on
/// every request. `rotator`, when present, chooses the path for each
/// request and receives outcome updates.
pub async fn run_tier(
    executor: &mut RetryExecutor,
    sender: &dyn ProbeSender,
    rotator: Option<&Mutex<EndpointRotator>>,
    base_url: &str,
    default_path: &str,
    headers: &HeaderMap,
    spec: &TierSpec,
    cancel: &CancellationToken,
) -> TierResult {
    let mut result = TierResult::empty(spec.label);
    let tier_start = Instant::now();
    let latencies = Mutex::new(Vec::new());
    let mut current_rate = spec.start_rate;

    'ramp: while current_rate <= spec.max_rate {
        if tier_start.elapsed() >= spec.max_duration {
            result.diagnostics.push("max duration exhausted".to_string());
            break;
        }
        if cancel.is_cancelled() {
            result.diagnostics.push("cancelled".to_string());
            break;
        }

        let iteration_start = Instant::now();
        let interval = Duration::from_secs_f64(spec.window_seconds as f64 / current_rate as f64)
            .max(Duration::from_millis(1));
        let limiter = pacing_limiter(interval);

        let mut batch_attempted = 0u64;
        let mut batch_successes = 0u64;
        let mut limiting_error: Option<DetectError> = None;

        for i in 0..current_rate {
            if i > 0 {
                limiter.until_ready().await;
            }
            if cancel.is_cancelled() {
                result.diagnostics.push("cancelled".to_string());
                break 'ramp;
            }

            let outcome = executor
                .execute(|| issue_probe(sender, rotator, base_url, default_path, headers, &latencies))
                .await;

            batch_attempted += 1;
            result.requests_issued += 1;

            if outcome.success {
                result.successes += 1;
                batch_successes += 1;
            } else if let Some(error) = outcome.final_error {
                match &error {
                    DetectError::RateLimitExceeded { .. } => {
                        limiting_error = Some(error);
                        break;
                    }
                    DetectError::ServerError { .. } => {
                        result.server_errors += 1;
                    }
                    _ => {}
                }
            }
        }

        if let Some(DetectError::RateLimitExceeded {
            retry_after_seconds,
            headers: limiting_headers,
        }) = limiting_error
        {
            result.limit_found = true;
            result.limit_rate = Some(current_rate);
            result.retry_after_seconds = retry_after_seconds;

            let rate_limit = limiting_headers
                .as_ref()
                .and_then(|h| HeaderAnalyzer::analyze(h).into_iter().next())
                .unwrap_or_else(|| {
                    RateLimit::new(
                        current_rate.saturating_sub(1).max(1),
                        0,
                        None,
                        spec.window_seconds,
                        DetectionSource::Probed,
                    )
                });
            result.rate_limit = Some(rate_limit);

            if let Some(seconds) = retry_after_seconds {
                let guard = Duration::from_secs(seconds).min(MAX_BACKOFF_GUARD);
                log_info!(tier = %spec.label, guard_secs = guard.as_secs_f64(), "sleeping for Retry-After safety guard");
                result.backoff_triggered = true;
                sleep(guard).await;
            }
            break;
        }

        let ratio = if batch_attempted > 0 {
            batch_successes as f64 / batch_attempted as f64
        } else {
            0.0
        };

        let next_rate = if spec.adaptive_increment && ratio > spec.adaptive_threshold {
            result.adaptive_increments += 1;
            current_rate + (spec.increment as f64 * spec.adaptive_multiplier).round() as u64
        } else {
            current_rate + spec.increment
        };

        log_debug!(
            tier = %spec.label,
            current_rate = current_rate,
            next_rate = next_rate,
            success_ratio = ratio,
            "completed ramp iteration"
        );
        current_rate = next_rate;

        let elapsed = iteration_start.elapsed();
        let window = Duration::from_secs(spec.window_seconds);
        if elapsed < window && current_rate <= spec.max_rate {
            sleep(window - elapsed).await;
        }
    }

    if !result.limit_found && current_rate > spec.max_rate {
        result.diagnostics.push("max rate exhausted without observing a limit".to_string());
    }

    let latencies = latencies.into_inner();
    result.mean_latency = mean(&latencies);
    result.error_rate = if result.requests_issued > 0 {
        result.server_errors as f64 / result.requests_issued as f64
    } else {
        0.0
    };
    result.duration = tier_start.elapsed();
    result
}
