//! Orchestrates the whole detection run: an initial zero-cost header
//! probe, then one Tier Tester per configured window, then merge,
//! most-restrictive selection, recommendation, and consistency
//! validation.
//!
//! This is the only component that knows about all four of the others —
//! it depends on the header analyzer, the fault tolerance layer, the
//! rotator, and the tier tester, but none of those depend back on it.

use crate::config::{DetectorConfig, StrategyFlags};
use crate::error::{DetectError, DetectResult};
use crate::header_analyzer::HeaderAnalyzer;
use crate::logging::{log_info, log_warn};
use crate::models::{DetectionSource, MultiTierResult, RateLimit, TierLabel, TierResult, TierSpec};
use crate::probe::{ProbeRequest, ProbeSender};
use crate::retry::{CircuitBreakerConfig, RetryExecutor, RetryPolicy};
use crate::rotator::EndpointRotator;
use crate::tier_tester::{self, CancellationToken};
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Orchestrates a complete multi-tier detection run.
pub struct MultiTierDetector {
    sender: Arc<dyn ProbeSender>,
    retry_policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    per_call_timeout: Duration,
}

impl MultiTierDetector {
    /// Build a detector around a probe sender and the fault tolerance
    /// parameters applied to every outbound request it issues, directly
    /// or through a tier tester.
    pub fn new(
        sender: Arc<dyn ProbeSender>,
        retry_policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            retry_policy,
            breaker_config,
            per_call_timeout,
        }
    }

    fn new_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.retry_policy.clone(), self.breaker_config, self.per_call_timeout)
    }

    /// Run a full detection against `config`. `cancel`, when supplied,
    /// lets a caller abort long-running tier tests; a fresh token is
    /// created if `None`.
    pub async fn detect(
        &self,
        config: &DetectorConfig,
        cancel: Option<CancellationToken>,
    ) -> DetectResult<MultiTierResult> {
        let run_start = Instant::now();
        let headers = config.build_headers()?;
        let cancel = cancel.unwrap_or_default();

        let rotator = if config.endpoints.is_empty() {
            None
        } else {
            let entries = config
                .endpoints
                .iter()
                .map(|path| crate::models::EndpointEntry::new(path.clone(), 1.0))
                .collect();
            Some(Mutex::new(EndpointRotator::new(
                entries,
                config.rotation_policy.clone(),
                config.infer_per_endpoint_limits,
            )))
        };

        let mut total_requests = 0u64;

        let header_limits = self
            .initial_probe(&config.base_url, &config.endpoint, &headers)
            .await?;
        total_requests += 1;

        let mut per_tier_header_limits: BTreeMap<TierLabel, RateLimit> = BTreeMap::new();
        for limit in header_limits {
            if let Some(label) = label_for_window(limit.window_seconds) {
                per_tier_header_limits.entry(label).or_insert(limit);
            }
        }

        let tier_results = self
            .run_tiers(&config.tiers, &config.strategy, &config.base_url, &config.endpoint, &headers, rotator.as_ref(), &cancel)
            .await;

        for result in &tier_results {
            total_requests += result.requests_issued;
        }

        let mut tiers: BTreeMap<TierLabel, RateLimit> = BTreeMap::new();
        let mut consistency_warnings = Vec::new();

        for (label, limit) in per_tier_header_limits {
            tiers.insert(label, limit);
        }

        for result in &tier_results {
            let Some(probed) = result.rate_limit.clone() else {
                continue;
            };
            match tiers.get(&result.label) {
                Some(existing) if existing.ceiling != probed.ceiling => {
                    consistency_warnings.push(format!(
                        "{}: header disclosed ceiling {} disagrees with probed ceiling {}, keeping the lower",
                        result.label, existing.ceiling, probed.ceiling
                    ));
                    if probed.ceiling < existing.ceiling {
                        tiers.insert(result.label, probed);
                    }
                }
                Some(_) => {}
                None => {
                    tiers.insert(result.label, probed);
                }
            }
        }

        let most_restrictive = tiers
            .iter()
            .min_by(|(_, a), (_, b)| a.permitted_rate().partial_cmp(&b.permitted_rate()).unwrap())
            .map(|(label, _)| *label);

        let recommended_rate = most_restrictive
            .and_then(|label| tiers.get(&label))
            .map(|limit| {
                let reduced = (limit.ceiling as f64 * (1.0 - config.strategy.safety_margin)).floor() as u64;
                reduced.max(1)
            })
            .unwrap_or(1);

        if config.strategy.validate_consistency {
            consistency_warnings.extend(validate_consistency(&tiers));
        }

        let confidence = compute_confidence(&tiers, &tier_results, &consistency_warnings);

        let total_duration = run_start.elapsed();
        log_info!(
            total_requests = total_requests,
            limits_found = tiers.len(),
            duration_ms = total_duration.as_millis(),
            "detection run complete"
        );

        Ok(MultiTierResult {
            timestamp: Utc::now(),
            base_url: config.base_url.clone(),
            endpoints_probed: if config.endpoints.is_empty() {
                vec![config.endpoint.clone()]
            } else {
                config.endpoints.clone()
            },
            limits_found: tiers.len(),
            most_restrictive,
            recommended_rate,
            total_requests,
            total_duration,
            tier_results,
            confidence,
            consistency_warnings,
            tiers,
        })
    }

    async fn initial_probe(&self, base_url: &str, endpoint: &str, headers: &HeaderMap) -> DetectResult<Vec<RateLimit>> {
        let mut executor = self.new_executor();
        let url = format!("{base_url}{endpoint}");
        let sender = Arc::clone(&self.sender);
        let request_headers = headers.clone();

        let outcome = executor
            .execute(|| {
                let sender = Arc::clone(&sender);
                let request = ProbeRequest::get(url.clone(), request_headers.clone());
                async move { sender.send(&request).await }
            })
            .await;

        match outcome.final_response {
            Some(response) => Ok(HeaderAnalyzer::analyze(&response.headers)),
            None => Err(outcome
                .final_error
                .unwrap_or_else(|| DetectError::other(None, "initial probe failed with no response"))),
        }
    }

    async fn run_tiers(
        &self,
        tiers: &[TierSpec],
        strategy: &StrategyFlags,
        base_url: &str,
        default_path: &str,
        headers: &HeaderMap,
        rotator: Option<&Mutex<EndpointRotator>>,
        cancel: &CancellationToken,
    ) -> Vec<TierResult> {
        if tiers.is_empty() {
            return Vec::new();
        }

        if !strategy.parallel {
            let mut results = Vec::with_capacity(tiers.len());
            for spec in tiers {
                if strategy.resolve_dependencies && is_dependency_blocked(spec, &results) {
                    let mut blocked = TierResult::empty(spec.label);
                    blocked.diagnostics.push("skipped: longer-window limit forbids a meaningful probe".to_string());
                    results.push(blocked);
                    continue;
                }

                let mut executor = self.new_executor();
                let result = tier_tester::run_tier(
                    &mut executor,
                    self.sender.as_ref(),
                    rotator,
                    base_url,
                    default_path,
                    headers,
                    spec,
                    cancel,
                )
                .await;
                let found = result.limit_found;
                results.push(result);
                if strategy.stop_on_first_limit && found {
                    break;
                }
            }
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(strategy.max_concurrent_tiers.max(1)));
        let mut handles = Vec::with_capacity(tiers.len());
        for spec in tiers.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let sender = Arc::clone(&self.sender);
            let headers = headers.clone();
            let base_url = base_url.to_string();
            let default_path = default_path.to_string();
            let cancel = cancel.clone();
            let retry_policy = self.retry_policy.clone();
            let breaker_config = self.breaker_config;
            let per_call_timeout = self.per_call_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let mut executor = RetryExecutor::new(retry_policy, breaker_config, per_call_timeout);
                tier_tester::run_tier(
                    &mut executor,
                    sender.as_ref(),
                    None,
                    &base_url,
                    &default_path,
                    &headers,
                    &spec,
                    &cancel,
                )
                .await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    log_warn!(error = %join_error, "tier test task panicked");
                }
            }
        }
        results
    }
}

fn label_for_window(window_seconds: u64) -> Option<TierLabel> {
    match window_seconds {
        10 => Some(TierLabel::TenSec),
        60 => Some(TierLabel::OneMin),
        900 => Some(TierLabel::FifteenMin),
        3600 => Some(TierLabel::OneHour),
        86_400 => Some(TierLabel::OneDay),
        _ => None,
    }
}

fn is_dependency_blocked(spec: &TierSpec, prior_results: &[TierResult]) -> bool {
    prior_results.iter().any(|prior| {
        prior.label.window_seconds() > spec.label.window_seconds()
            && prior
                .rate_limit
                .as_ref()
                .is_some_and(|limit| limit.permitted_rate() * spec.label.window_seconds() as f64 < 1.0)
    })
}

fn validate_consistency(tiers: &BTreeMap<TierLabel, RateLimit>) -> Vec<String> {
    let mut sorted: Vec<(&TierLabel, &RateLimit)> = tiers.iter().collect();
    sorted.sort_by_key(|(label, _)| label.window_seconds());

    let mut warnings = Vec::new();
    for pair in sorted.windows(2) {
        let (short_label, short_limit) = pair[0];
        let (long_label, long_limit) = pair[1];
        let extrapolated = short_limit.permitted_rate() * long_limit.window_seconds as f64;
        if extrapolated > long_limit.ceiling as f64 * 1.10 {
            warnings.push(format!(
                "{short_label} ceiling of {} extrapolated to {long_label}'s window ({extrapolated:.1}) exceeds its ceiling {} by more than 10%",
                short_limit.ceiling, long_limit.ceiling
            ));
        }
    }
    warnings
}

fn compute_confidence(
    tiers: &BTreeMap<TierLabel, RateLimit>,
    tier_results: &[TierResult],
    consistency_warnings: &[String],
) -> f64 {
    if tiers.is_empty() {
        return 0.0;
    }

    let mut confidence = 1.0;
    if tiers.values().any(|limit| limit.source == DetectionSource::Probed) {
        confidence -= 0.1;
    }

    let total_requests: u64 = tier_results.iter().map(|r| r.requests_issued).sum();
    let total_errors: u64 = tier_results.iter().map(|r| r.server_errors).sum();
    if total_requests > 0 {
        let error_rate = total_errors as f64 / total_requests as f64;
        confidence -= error_rate * 0.5;
    }

    confidence -= 0.05 * consistency_warnings.len() as f64;
    confidence.clamp(0.0, 1.0)
}
