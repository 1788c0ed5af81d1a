use crate::config::{AuthConfig, DetectorConfig, StrategyFlags};
use crate::detector::MultiTierDetector;
use crate::error::DetectError;
use crate::models::{DetectionSource, TierLabel, TierSpec};
use crate::probe::{MockProbeSender, ProbeResponse};
use crate::retry::{CircuitBreakerConfig, RetryPolicy};
use crate::rotator::RotationPolicy;
use reqwest::header::HeaderMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn no_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        cap_delay: Duration::from_millis(10),
        retryable_statuses: Default::default(),
        retry_on_timeout: false,
        jitter: false,
    }
}

fn base_config(tiers: Vec<TierSpec>) -> DetectorConfig {
    DetectorConfig {
        base_url: "http://example".to_string(),
        endpoint: "/".to_string(),
        endpoints: Vec::new(),
        headers: BTreeMap::new(),
        auth: AuthConfig::None,
        tiers,
        strategy: StrategyFlags::default(),
        retry_policy: RetryPolicy::default(),
        circuit_breaker: CircuitBreakerConfig::default(),
        rotation_policy: RotationPolicy::default(),
        infer_per_endpoint_limits: true,
        per_call_timeout: Duration::from_secs(5),
    }
}

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            reqwest::header::HeaderName::try_from(*name).unwrap(),
            value.parse().unwrap(),
        );
    }
    map
}

#[tokio::test]
async fn detect_with_no_tiers_reports_a_header_only_disclosure() {
    let mut mock = MockProbeSender::new();
    mock.expect_send().returning(|_| {
        Ok(ProbeResponse {
            status: 200,
            headers: headers(&[("X-RateLimit-Limit-Minute", "100"), ("X-RateLimit-Remaining-Minute", "90")]),
        })
    });

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(Vec::new());

    let result = detector.detect(&config, None).await.unwrap();

    assert_eq!(result.limits_found, 1);
    assert_eq!(result.total_requests, 1);
    assert!(result.tier_results.is_empty());
    let limit = result.tiers.get(&TierLabel::OneMin).unwrap();
    assert_eq!(limit.ceiling, 100);
    assert_eq!(limit.source, DetectionSource::Header);
    assert_eq!(result.most_restrictive, Some(TierLabel::OneMin));
    assert_eq!(result.recommended_rate, 90);
}

#[tokio::test]
async fn detect_probes_a_single_tier_and_merges_the_ceiling() {
    let spec = TierSpec::new(TierLabel::TenSec, 1, 3, 10, 3, Duration::from_secs(5), false, false).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let mut mock = MockProbeSender::new();
    mock.expect_send().returning(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= 5 {
            Ok(ProbeResponse { status: 200, headers: HeaderMap::new() })
        } else {
            Err(DetectError::from_status(429, "limited", "/", None))
        }
    });

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(vec![spec]);

    let result = detector.detect(&config, None).await.unwrap();

    assert_eq!(result.limits_found, 1);
    assert_eq!(result.total_requests, 6); // 1 initial probe + 5 ramp requests
    assert_eq!(result.tier_results.len(), 1);
    assert!(result.tier_results[0].limit_found);

    let limit = result.tiers.get(&TierLabel::TenSec).unwrap();
    assert_eq!(limit.ceiling, 5);
    assert_eq!(limit.source, DetectionSource::Probed);
    assert_eq!(result.most_restrictive, Some(TierLabel::TenSec));
    assert_eq!(result.recommended_rate, 4); // floor(5 * 0.9)
    assert!(result.consistency_warnings.is_empty());
}

#[tokio::test]
async fn detect_warns_when_a_header_ceiling_disagrees_with_the_probed_one() {
    let spec = TierSpec::new(TierLabel::OneMin, 1, 3, 10, 3, Duration::from_secs(5), false, false).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let mut mock = MockProbeSender::new();
    mock.expect_send().returning(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            // initial probe discloses a much higher ceiling than what the ramp will find
            Ok(ProbeResponse {
                status: 200,
                headers: headers(&[("X-RateLimit-Limit-Minute", "100"), ("X-RateLimit-Remaining-Minute", "100")]),
            })
        } else if n <= 6 {
            Ok(ProbeResponse { status: 200, headers: HeaderMap::new() })
        } else {
            Err(DetectError::from_status(429, "limited", "/", None))
        }
    });

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(vec![spec]);

    let result = detector.detect(&config, None).await.unwrap();

    assert_eq!(result.consistency_warnings.len(), 1);
    assert!(result.consistency_warnings[0].contains("disagrees"));
    // the lower, probed ceiling wins
    let limit = result.tiers.get(&TierLabel::OneMin).unwrap();
    assert_eq!(limit.ceiling, 5);
    assert_eq!(limit.source, DetectionSource::Probed);
}

#[tokio::test]
async fn recommended_rate_uses_the_most_restrictive_tiers_ceiling_not_the_global_minimum() {
    // Headers disclose a tight 10s ceiling (100) and a looser 1min ceiling
    // (300). By permitted rate, 10s:100 (10/s) is more restrictive than
    // 1min:300 (5/s) is not — the minute tier is actually the most
    // restrictive one (5/s < 10/s), so recommended_rate must come from its
    // ceiling (300), not from the smaller raw ceiling (100).
    let mut mock = MockProbeSender::new();
    mock.expect_send().returning(|_| {
        Ok(ProbeResponse {
            status: 200,
            headers: headers(&[
                ("X-RateLimit-Limit-10s", "100"),
                ("X-RateLimit-Remaining-10s", "100"),
                ("X-RateLimit-Limit-Minute", "300"),
                ("X-RateLimit-Remaining-Minute", "300"),
            ]),
        })
    });

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(Vec::new());

    let result = detector.detect(&config, None).await.unwrap();

    assert_eq!(result.limits_found, 2);
    assert_eq!(result.most_restrictive, Some(TierLabel::OneMin));
    assert_eq!(result.recommended_rate, 270); // floor(300 * 0.9), not floor(100 * 0.9)
}

#[tokio::test]
async fn detect_with_no_tiers_and_no_headers_has_zero_confidence() {
    let mut mock = MockProbeSender::new();
    mock.expect_send()
        .returning(|_| Ok(ProbeResponse { status: 200, headers: HeaderMap::new() }));

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(Vec::new());

    let result = detector.detect(&config, None).await.unwrap();

    assert_eq!(result.limits_found, 0);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.most_restrictive, None);
    assert_eq!(result.recommended_rate, 1);
}

#[tokio::test]
async fn detect_surfaces_the_initial_probe_failure_when_it_never_succeeds() {
    let mut mock = MockProbeSender::new();
    mock.expect_send()
        .returning(|_| Err(DetectError::from_status(503, "down", "/", None)));

    let detector = MultiTierDetector::new(Arc::new(mock), no_retry_policy(), CircuitBreakerConfig::default(), Duration::from_secs(5));
    let config = base_config(Vec::new());

    let result = detector.detect(&config, None).await;
    assert!(result.is_err());
}
