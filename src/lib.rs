//! # rate-limit-optimizer
//!
//! Black-box discovery of a remote HTTP API's rate-limit policy across
//! multiple overlapping time windows (seconds, minutes, hours, days).
//!
//! The system issues real requests at controlled rates, watches for
//! successes, 429 rejections, and rate-limit-disclosure response headers,
//! and infers the tightest enforced limit per window. It never attempts
//! to bypass a limit — only to characterize it.
//!
//! ## Components
//!
//! - [`header_analyzer`] — parses rate-limit disclosures out of response
//!   headers under varied naming conventions.
//! - [`retry`] — retry scheduling with exponential/linear backoff and a
//!   three-state circuit breaker, wrapping every outbound request.
//! - [`rotator`] — chooses which endpoint path receives the next probing
//!   request and tracks per-endpoint health.
//! - [`tier_tester`] — drives request rate upward within one time window
//!   until a limit, a rate ceiling, or a duration cap is hit.
//! - [`detector`] — orchestrates a full run: initial probe, tier tests,
//!   merge, and consistency validation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rate_limit_optimizer::{DetectorConfig, MultiTierDetector, HttpProbeSender};
//! use std::sync::Arc;
//!
//! # async fn example() -> rate_limit_optimizer::DetectResult<()> {
//! let config = DetectorConfig::from_env()?;
//! let detector = MultiTierDetector::new(
//!     Arc::new(HttpProbeSender::new()),
//!     config.retry_policy.clone(),
//!     config.circuit_breaker,
//!     config.per_call_timeout,
//! );
//! let result = detector.detect(&config, None).await?;
//! println!("recommended rate: {}/s", result.recommended_rate);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::missing_errors_doc)]

// =============================================================================
// Module declarations
// =============================================================================

pub mod config;
pub mod detector;
pub mod error;
pub mod header_analyzer;
pub mod models;
pub mod probe;
pub mod retry;
pub mod rotator;
pub mod tier_tester;

pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

pub use config::{AuthConfig, DetectorConfig, StrategyFlags};
pub use detector::MultiTierDetector;
pub use error::{DetectError, DetectResult, ErrorCategory, ErrorSeverity};
pub use header_analyzer::HeaderAnalyzer;
pub use models::{
    DetectionSource, EndpointEntry, MultiTierResult, RateLimit, TierLabel, TierResult, TierSpec,
};
pub use probe::{HttpProbeSender, ProbeRequest, ProbeResponse, ProbeSender};
pub use retry::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryExecutor, RetryOutcome, RetryPolicy};
pub use rotator::{EndpointRotator, RotationMetrics, RotationPolicy};
pub use tier_tester::CancellationToken;
