//! Error types for the rate-limit detection pipeline.
//!
//! [`DetectError`] is the single error type threaded through every
//! component: the header analyzer never produces one (it is infallible by
//! contract), but the fault tolerance layer, tier tester, rotator and
//! detector all resolve to it. Each variant corresponds to one of the error
//! *kinds* the specification calls out, not to an HTTP library's own type
//! hierarchy.
//!
//! # Example
//!
//! ```rust
//! use rate_limit_optimizer::{DetectError, DetectResult};
//!
//! fn classify(err: &DetectError) {
//!     if err.is_retryable() {
//!         println!("will retry: {}", err);
//!     }
//!     println!("{}", err.user_message());
//! }
//!
//! fn example() -> DetectResult<()> {
//!     Ok(())
//! }
//! ```

use crate::header_analyzer::HeaderAnalyzer;
use crate::logging::{log_error, log_warn};
use reqwest::header::HeaderMap;
use thiserror::Error;

/// Error category as named by the specification's error-handling design
/// (kinds, not type names).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Observed 429.
    RateLimit,
    /// 5xx from the target.
    ServerError,
    /// Transport/DNS/connection failure.
    NetworkError,
    /// A call or total-operation timeout elapsed.
    Timeout,
    /// 401/403 from the target.
    AuthError,
    /// 404 from the target.
    NotFound,
    /// Unclassified status or failure.
    Other,
    /// Cooperative cancellation; not a failure.
    Cancelled,
    /// Synthetic rejection from an open circuit breaker.
    BreakerOpen,
    /// Caller-supplied configuration violates an invariant.
    Configuration,
}

/// Severity for logging and alerting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// System is unusable or data integrity is at risk.
    Critical,
    /// Action failed but the system is stable.
    Error,
    /// Unexpected but recoverable.
    Warning,
    /// Expected, non-urgent outcome.
    Info,
}

/// Convenient alias for `Result<T, DetectError>`.
pub type DetectResult<T> = std::result::Result<T, DetectError>;

/// Errors produced anywhere in the detection pipeline.
#[derive(Error, Debug)]
pub enum DetectError {
    /// The target responded 429. `retry_after_seconds` is `None` when the
    /// response carried no `Retry-After` header. `headers` retains the
    /// triggering response's headers so a tier tester can run the header
    /// analyzer over a 429 even after the fault tolerance layer has
    /// exhausted its retries and surfaced this as a terminal error.
    #[error("rate limited (retry after {retry_after_seconds:?}s)")]
    RateLimitExceeded {
        /// Server-supplied wait hint, if present.
        retry_after_seconds: Option<u64>,
        /// Headers of the triggering 429 response, if available.
        headers: Option<HeaderMap>,
    },

    /// The target responded with a 5xx status.
    #[error("server error: {status} {message}")]
    ServerError {
        /// The HTTP status code.
        status: u16,
        /// A short diagnostic, not necessarily the full response body.
        message: String,
    },

    /// Transport-level failure: DNS, connection refused, TLS, reset, etc.
    #[error("network error: {message}")]
    NetworkError {
        /// Description of the failure.
        message: String,
        /// The underlying transport error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A per-call or total-operation timeout elapsed.
    #[error("timed out after {timeout_seconds}s")]
    Timeout {
        /// The timeout duration that was exceeded.
        timeout_seconds: u64,
    },

    /// The target responded 401 or 403.
    #[error("authentication failed: {status} {message}")]
    AuthError {
        /// The HTTP status code (401 or 403).
        status: u16,
        /// A short diagnostic.
        message: String,
    },

    /// The target responded 404.
    #[error("not found: {path}")]
    NotFound {
        /// The path that was requested.
        path: String,
    },

    /// Any other status or failure not covered by a more specific variant.
    #[error("request failed: {message}")]
    Other {
        /// The HTTP status, if one was received.
        status: Option<u16>,
        /// A short diagnostic.
        message: String,
    },

    /// Cooperative cancellation. Not a failure: callers that observe this
    /// should treat the operation as having stopped cleanly, not crashed.
    #[error("cancelled")]
    Cancelled,

    /// The circuit breaker rejected the call without attempting it.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// A caller-supplied value violates a documented invariant
    /// (e.g. a `TierSpec` with `max <= start`, or an empty endpoint list).
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the violated invariant.
        message: String,
    },
}

impl DetectError {
    /// Classify an HTTP status into the matching [`DetectError`] kind,
    /// following the same status table throughout the crate so every call
    /// site agrees on what is retryable.
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        path: impl Into<String>,
        headers: Option<HeaderMap>,
    ) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::auth_error(status, message),
            404 => Self::not_found(path),
            429 => {
                let retry_after = headers.as_ref().and_then(HeaderAnalyzer::retry_after_seconds);
                Self::rate_limit_exceeded(retry_after, headers)
            }
            500..=599 => Self::server_error(status, message),
            _ => Self::other(Some(status), message),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimit,
            Self::ServerError { .. } => ErrorCategory::ServerError,
            Self::NetworkError { .. } => ErrorCategory::NetworkError,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::AuthError { .. } => ErrorCategory::AuthError,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Other { .. } => ErrorCategory::Other,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::BreakerOpen => ErrorCategory::BreakerOpen,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    /// Get the error severity for logging and alerting.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::RateLimitExceeded { .. } => ErrorSeverity::Warning,
            Self::ServerError { .. } => ErrorSeverity::Warning,
            Self::NetworkError { .. } => ErrorSeverity::Error,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::AuthError { .. } => ErrorSeverity::Error,
            Self::NotFound { .. } => ErrorSeverity::Error,
            Self::Other { .. } => ErrorSeverity::Error,
            Self::Cancelled => ErrorSeverity::Info,
            Self::BreakerOpen => ErrorSeverity::Warning,
            Self::Configuration { .. } => ErrorSeverity::Error,
        }
    }

    /// Whether the fault tolerance layer should retry this error, absent
    /// any policy-specific override (retry-on-timeout, retryable-status
    /// set). Policy overrides are applied by the caller, not here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::ServerError { .. } | Self::NetworkError { .. }
        )
    }

    /// A message suitable for a diagnostic string on a `TierResult`, not
    /// exposing internal error plumbing.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => match retry_after_seconds {
                Some(s) => format!("rate limited, retry after {s}s"),
                None => "rate limited".to_string(),
            },
            Self::ServerError { status, .. } => format!("server error ({status})"),
            Self::NetworkError { .. } => "network error reaching target".to_string(),
            Self::Timeout { timeout_seconds } => format!("timed out after {timeout_seconds}s"),
            Self::AuthError { .. } => "authentication failed".to_string(),
            Self::NotFound { .. } => "endpoint not found".to_string(),
            Self::Other { status, .. } => match status {
                Some(s) => format!("request failed ({s})"),
                None => "request failed".to_string(),
            },
            Self::Cancelled => "cancelled".to_string(),
            Self::BreakerOpen => "circuit breaker open".to_string(),
            Self::Configuration { message } => format!("invalid configuration: {message}"),
        }
    }

    // ------------------------------------------------------------------
    // Constructors. Each logs at its category's severity before returning,
    // so an error is logged once, at its creation site.
    // ------------------------------------------------------------------

    /// Build a rate-limit error (logs at WARN).
    pub fn rate_limit_exceeded(retry_after_seconds: Option<u64>, headers: Option<HeaderMap>) -> Self {
        log_warn!(
            error_type = "rate_limit",
            retry_after_seconds = ?retry_after_seconds,
            "target rejected request with 429"
        );
        Self::RateLimitExceeded {
            retry_after_seconds,
            headers,
        }
    }

    /// Build a server-error (5xx) error (logs at WARN).
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "server_error",
            status = status,
            message = %message,
            "target returned a server error"
        );
        Self::ServerError { status, message }
    }

    /// Build a network-error error (logs at ERROR).
    pub fn network_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let message = message.into();
        log_error!(
            error_type = "network_error",
            message = %message,
            has_source = source.is_some(),
            "transport failure reaching target"
        );
        Self::NetworkError { message, source }
    }

    /// Build a timeout error (logs at WARN).
    pub fn timeout(timeout_seconds: u64) -> Self {
        log_warn!(
            error_type = "timeout",
            timeout_seconds = timeout_seconds,
            "request timed out"
        );
        Self::Timeout { timeout_seconds }
    }

    /// Build an authentication error (logs at ERROR).
    pub fn auth_error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "auth_error",
            status = status,
            message = %message,
            "authentication with target failed"
        );
        Self::AuthError { status, message }
    }

    /// Build a not-found error (logs at ERROR).
    pub fn not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        log_error!(error_type = "not_found", path = %path, "endpoint not found");
        Self::NotFound { path }
    }

    /// Build a generic, unclassified error (logs at ERROR).
    pub fn other(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "other",
            status = ?status,
            message = %message,
            "unclassified request failure"
        );
        Self::Other { status, message }
    }

    /// Build a breaker-open rejection (logs at WARN).
    pub fn breaker_open() -> Self {
        log_warn!(
            error_type = "breaker_open",
            "circuit breaker rejected call"
        );
        Self::BreakerOpen
    }

    /// Build a configuration-invariant error (logs at ERROR).
    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "configuration",
            message = %message,
            "configuration invariant violated"
        );
        Self::Configuration { message }
    }
}
