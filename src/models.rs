//! Core data model: rate limits, tier specifications and results, and the
//! per-endpoint bookkeeping the rotator maintains.
//!
//! These types carry no behavior beyond validation at construction and the
//! small derived quantities the specification calls out (`permitted_rate`,
//! window-second lookups). The components (`header_analyzer`, `tier_tester`,
//! `detector`, `rotator`) build and combine them.

use crate::error::{DetectError, DetectResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where a [`RateLimit`] was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DetectionSource {
    /// Disclosed directly in response headers.
    Header,
    /// Inferred from an observed 429 during ramp testing.
    Probed,
}

/// One disclosed or inferred rate limit.
///
/// `remaining` is always clamped into `0..=ceiling` at construction time —
/// the wire is never trusted to honor that invariant itself.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RateLimit {
    /// Maximum permitted request count per window. Always `> 0`.
    pub ceiling: u64,
    /// Requests remaining in the current window, clamped to `0..=ceiling`.
    pub remaining: u64,
    /// Absolute time the window resets, if known.
    pub reset_at: Option<DateTime<Utc>>,
    /// Window duration in seconds. Always `> 0`.
    pub window_seconds: u64,
    /// Whether this was disclosed in a header or inferred from a 429.
    pub source: DetectionSource,
}

impl RateLimit {
    /// Construct a `RateLimit`, clamping `remaining` into `0..=ceiling` per
    /// the data model's invariant (violations from the wire are clamped,
    /// not rejected).
    pub fn new(
        ceiling: u64,
        remaining: i64,
        reset_at: Option<DateTime<Utc>>,
        window_seconds: u64,
        source: DetectionSource,
    ) -> Self {
        let remaining = remaining.max(0) as u64;
        Self {
            ceiling,
            remaining: remaining.min(ceiling),
            reset_at,
            window_seconds,
            source,
        }
    }

    /// Requests permitted per second under this limit.
    pub fn permitted_rate(&self) -> f64 {
        self.ceiling as f64 / self.window_seconds as f64
    }
}

/// The fixed set of time windows this system knows how to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum TierLabel {
    /// 10 seconds.
    TenSec,
    /// 1 minute.
    OneMin,
    /// 15 minutes.
    FifteenMin,
    /// 1 hour.
    OneHour,
    /// 1 day.
    OneDay,
}

impl TierLabel {
    /// The canonical window length, in seconds, for this tier.
    pub fn window_seconds(self) -> u64 {
        match self {
            Self::TenSec => 10,
            Self::OneMin => 60,
            Self::FifteenMin => 900,
            Self::OneHour => 3600,
            Self::OneDay => 86_400,
        }
    }

    /// Short label used in diagnostics and consistency-warning text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TenSec => "10s",
            Self::OneMin => "minute",
            Self::FifteenMin => "15min",
            Self::OneHour => "hour",
            Self::OneDay => "day",
        }
    }
}

impl std::fmt::Display for TierLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A probe configuration for one time window.
///
/// Read-only once constructed; a `TierTester` consumes one by reference and
/// never mutates it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TierSpec {
    /// Which window this spec probes.
    pub label: TierLabel,
    /// Window length in seconds. Usually `label.window_seconds()` but kept
    /// explicit so tests can probe a window under a nonstandard length.
    pub window_seconds: u64,
    /// Starting request rate for the ramp.
    pub start_rate: u64,
    /// Ceiling the ramp will not exceed.
    pub max_rate: u64,
    /// Rate increment applied each non-adaptive iteration.
    pub increment: u64,
    /// Wall-clock cap for the whole tier test.
    pub max_duration: Duration,
    /// Whether a high-success-ratio batch doubles the increment instead of
    /// adding it once.
    pub adaptive_increment: bool,
    /// Whether this tier runs in an aggressive (less conservative) mode.
    /// Reserved for caller-side policy; the tier tester itself does not
    /// branch on it beyond passing it through to diagnostics.
    pub aggressive: bool,
    /// Batch success ratio above which an adaptive iteration doubles its
    /// increment instead of adding it once. Default `0.95`.
    pub adaptive_threshold: f64,
    /// Multiplier applied to `increment` on an adaptive iteration. Default
    /// `2.0`.
    pub adaptive_multiplier: f64,
}

impl TierSpec {
    /// Construct a `TierSpec`, enforcing `max_rate > start_rate`.
    pub fn new(
        label: TierLabel,
        window_seconds: u64,
        start_rate: u64,
        max_rate: u64,
        increment: u64,
        max_duration: Duration,
        adaptive_increment: bool,
        aggressive: bool,
    ) -> DetectResult<Self> {
        if max_rate <= start_rate {
            return Err(DetectError::configuration(format!(
                "TierSpec for {label}: max_rate ({max_rate}) must exceed start_rate ({start_rate})"
            )));
        }
        Ok(Self {
            label,
            window_seconds,
            start_rate,
            max_rate,
            increment,
            max_duration,
            adaptive_increment,
            aggressive,
            adaptive_threshold: 0.95,
            adaptive_multiplier: 2.0,
        })
    }
}

/// Outcome of testing one [`TierSpec`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TierResult {
    /// Which tier this result is for.
    pub label: TierLabel,
    /// Whether a limit was observed (as opposed to exhausting max rate or
    /// the test duration without seeing one).
    pub limit_found: bool,
    /// The inferred or disclosed limit, if `limit_found`.
    pub rate_limit: Option<RateLimit>,
    /// Total requests issued during this tier test.
    pub requests_issued: u64,
    /// 2xx responses observed.
    pub successes: u64,
    /// 5xx responses observed.
    pub server_errors: u64,
    /// `server_errors / requests_issued`, or `0.0` if none were issued.
    pub error_rate: f64,
    /// Mean latency across all attempts issued.
    pub mean_latency: Duration,
    /// Wall-clock time spent on this tier.
    pub duration: Duration,
    /// Whether the tester slept for a server-supplied `Retry-After` after
    /// observing the limit.
    pub backoff_triggered: bool,
    /// The `Retry-After` value observed on the limiting response, if any.
    pub retry_after_seconds: Option<u64>,
    /// The request rate at which limiting was observed.
    pub limit_rate: Option<u64>,
    /// How many iterations used the adaptive (doubled) increment.
    pub adaptive_increments: u32,
    /// Free-form diagnostic strings (e.g. `"cancelled"`).
    pub diagnostics: Vec<String>,
}

impl TierResult {
    /// An empty result for a tier that has not yet produced any
    /// observations, used as the tester's running accumulator.
    pub fn empty(label: TierLabel) -> Self {
        Self {
            label,
            limit_found: false,
            rate_limit: None,
            requests_issued: 0,
            successes: 0,
            server_errors: 0,
            error_rate: 0.0,
            mean_latency: Duration::ZERO,
            duration: Duration::ZERO,
            backoff_triggered: false,
            retry_after_seconds: None,
            limit_rate: None,
            adaptive_increments: 0,
            diagnostics: Vec::new(),
        }
    }
}

/// Aggregate result of a full multi-tier detection run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MultiTierResult {
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// Base URL probed.
    pub base_url: String,
    /// The endpoint paths actually probed (post-rotation).
    pub endpoints_probed: Vec<String>,
    /// Per-tier-label rate limit slots; absent entries were neither
    /// disclosed nor probed.
    pub tiers: BTreeMap<TierLabel, RateLimit>,
    /// The window whose permitted rate is smallest, if any tier has a
    /// limit.
    pub most_restrictive: Option<TierLabel>,
    /// `floor(most_restrictive_ceiling * (1 - safety_margin))`, at least `1`.
    pub recommended_rate: u64,
    /// Count of tiers with a non-null limit.
    pub limits_found: usize,
    /// Total requests issued across the whole run (probe + all tiers).
    pub total_requests: u64,
    /// Total wall-clock duration of the run.
    pub total_duration: Duration,
    /// Per-tier results, in the order tiers were tested.
    pub tier_results: Vec<TierResult>,
    /// Confidence in the result, in `[0, 1]`.
    pub confidence: f64,
    /// Consistency-check warnings, if `validate_consistency` was requested.
    pub consistency_warnings: Vec<String>,
}

/// One endpoint path known to a rotator, with its selection weight and
/// health/performance bookkeeping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointEntry {
    /// The path (joined onto the detector's base URL).
    pub path: String,
    /// Selection weight, used by the weighted policy. Always `> 0`.
    pub weight: f64,
    /// A rate limit inferred from a 429 seen on this specific endpoint.
    pub rate_limit: Option<RateLimit>,
    /// Whether this endpoint is currently considered healthy.
    pub healthy: bool,
    /// Recent observed latencies, bounded in size, used by the
    /// performance-adaptive weighted policy.
    #[serde(skip)]
    pub latency_window: std::collections::VecDeque<Duration>,
}

impl EndpointEntry {
    /// A newly registered endpoint: healthy, no observations yet.
    pub fn new(path: impl Into<String>, weight: f64) -> Self {
        Self {
            path: path.into(),
            weight,
            rate_limit: None,
            healthy: true,
            latency_window: std::collections::VecDeque::new(),
        }
    }

    /// Mean of the retained latency samples, or `None` if there are none
    /// yet.
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.latency_window.is_empty() {
            return None;
        }
        let total: Duration = self.latency_window.iter().sum();
        Some(total / self.latency_window.len() as u32)
    }
}
