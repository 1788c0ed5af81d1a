//! Configuration types for a detection run.
//!
//! [`DetectorConfig`] bundles everything the external configuration
//! collaborator is expected to supply (per §6 of the external-interfaces
//! design): target, auth, tier specs, strategy flags, retry policy,
//! circuit-breaker thresholds, and rotation policy. Core never loads a
//! config file itself — that stays a caller responsibility — but
//! `from_env` is provided in the same spirit as the teacher crate's own
//! environment-variable loader, for quick manual runs.

use crate::error::{DetectError, DetectResult};
use crate::logging::log_debug;
use crate::retry::{CircuitBreakerConfig, RetryPolicy};
use crate::rotator::RotationPolicy;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Authentication mode applied to every outbound probe request.
///
/// Core only injects headers; it never implements an OAuth flow, token
/// refresh, or credential storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    /// No authentication.
    None,
    /// A static header carrying an API key, e.g. `X-API-Key: ...`.
    ApiKey {
        /// Header name to set.
        header_name: String,
        /// Header value.
        value: String,
    },
    /// `Authorization: Bearer <token>`.
    BearerToken {
        /// The bearer token.
        token: String,
    },
    /// `Authorization: Basic <base64(username:password)>`.
    BasicAuth {
        /// Basic-auth username.
        username: String,
        /// Basic-auth password.
        password: String,
    },
}

impl AuthConfig {
    /// Merge this auth mode's headers into `headers`.
    pub fn apply(&self, headers: &mut HeaderMap) -> DetectResult<()> {
        match self {
            Self::None => {}
            Self::ApiKey { header_name, value } => {
                let name = HeaderName::try_from(header_name.as_str())
                    .map_err(|e| DetectError::configuration(format!("invalid header name {header_name:?}: {e}")))?;
                let value = HeaderValue::try_from(value.as_str())
                    .map_err(|e| DetectError::configuration(format!("invalid header value for {header_name:?}: {e}")))?;
                headers.insert(name, value);
            }
            Self::BearerToken { token } => {
                let value = HeaderValue::try_from(format!("Bearer {token}"))
                    .map_err(|e| DetectError::configuration(format!("invalid bearer token: {e}")))?;
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
            Self::BasicAuth { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                let value = HeaderValue::try_from(format!("Basic {encoded}"))
                    .map_err(|e| DetectError::configuration(format!("invalid basic auth credentials: {e}")))?;
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        Ok(())
    }
}

/// Strategy flags controlling how a [`crate::detector::MultiTierDetector`]
/// run behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyFlags {
    /// Stop iterating tiers once any tier reports a limit.
    pub stop_on_first_limit: bool,
    /// Run tier tests concurrently, capped by `max_concurrent_tiers`.
    pub parallel: bool,
    /// Skip a tier when an already-known longer-window limit forbids
    /// issuing enough requests to probe it meaningfully.
    pub resolve_dependencies: bool,
    /// Cross-check merged limits for consistency and emit warnings.
    pub validate_consistency: bool,
    /// Fraction the recommended rate is reduced below the observed
    /// ceiling.
    pub safety_margin: f64,
    /// Maximum simultaneous tier testers in parallel mode.
    pub max_concurrent_tiers: usize,
}

impl Default for StrategyFlags {
    fn default() -> Self {
        Self {
            stop_on_first_limit: false,
            parallel: false,
            resolve_dependencies: true,
            validate_consistency: true,
            safety_margin: 0.10,
            max_concurrent_tiers: 3,
        }
    }
}

/// Full configuration for one detection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Target base URL, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Path probed by the initial zero-cost header probe.
    pub endpoint: String,
    /// Endpoint paths available to the rotator. Empty disables rotation
    /// and every request uses `endpoint`.
    pub endpoints: Vec<String>,
    /// Static headers sent with every request, before auth injection.
    pub headers: BTreeMap<String, String>,
    /// Authentication mode.
    pub auth: AuthConfig,
    /// Per-window probe configurations.
    pub tiers: Vec<crate::models::TierSpec>,
    /// Strategy flags.
    pub strategy: StrategyFlags,
    /// Retry policy applied by the fault tolerance layer.
    pub retry_policy: RetryPolicy,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rotation policy, when rotating across more than one endpoint.
    pub rotation_policy: RotationPolicy,
    /// Whether the rotator infers a per-endpoint limit from 429 headers.
    pub infer_per_endpoint_limits: bool,
    /// Per-HTTP-call timeout.
    pub per_call_timeout: Duration,
}

impl DetectorConfig {
    /// Build the merged `HeaderMap` sent with every request: static
    /// headers first, then auth injection on top.
    pub fn build_headers(&self) -> DetectResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|e| DetectError::configuration(format!("invalid header name {name:?}: {e}")))?;
            let header_value = HeaderValue::try_from(value.as_str())
                .map_err(|e| DetectError::configuration(format!("invalid header value for {name:?}: {e}")))?;
            headers.insert(header_name, header_value);
        }
        self.auth.apply(&mut headers)?;
        Ok(headers)
    }

    /// Load a minimal configuration from environment variables, for quick
    /// manual runs. Only `RATE_LIMIT_TARGET_BASE_URL` is required; every
    /// other field falls back to a conservative default.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::Configuration`] if the base URL is missing.
    pub fn from_env() -> DetectResult<Self> {
        let base_url = std::env::var("RATE_LIMIT_TARGET_BASE_URL")
            .map_err(|_| DetectError::configuration("RATE_LIMIT_TARGET_BASE_URL is required"))?;
        let endpoint = std::env::var("RATE_LIMIT_TARGET_ENDPOINT").unwrap_or_else(|_| "/".to_string());

        log_debug!(
            base_url = %base_url,
            endpoint = %endpoint,
            "loading detector configuration from environment"
        );

        let auth = match std::env::var("RATE_LIMIT_AUTH_TYPE").as_deref() {
            Ok("api_key") => AuthConfig::ApiKey {
                header_name: std::env::var("RATE_LIMIT_AUTH_HEADER").unwrap_or_else(|_| "X-API-Key".to_string()),
                value: std::env::var("RATE_LIMIT_AUTH_VALUE").unwrap_or_default(),
            },
            Ok("bearer_token") => AuthConfig::BearerToken {
                token: std::env::var("RATE_LIMIT_AUTH_VALUE").unwrap_or_default(),
            },
            Ok("basic_auth") => AuthConfig::BasicAuth {
                username: std::env::var("RATE_LIMIT_AUTH_USERNAME").unwrap_or_default(),
                password: std::env::var("RATE_LIMIT_AUTH_PASSWORD").unwrap_or_default(),
            },
            _ => AuthConfig::None,
        };

        Ok(Self {
            base_url,
            endpoint,
            endpoints: Vec::new(),
            headers: BTreeMap::new(),
            auth,
            tiers: Vec::new(),
            strategy: StrategyFlags::default(),
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rotation_policy: RotationPolicy::default(),
            infer_per_endpoint_limits: true,
            per_call_timeout: Duration::from_secs(30),
        })
    }
}
