//! The one seam where this crate actually touches the network.
//!
//! [`ProbeSender`] issues a single HTTP request and classifies the
//! response into `Ok(ProbeResponse)` (2xx) or `Err(DetectError)` (429,
//! 4xx, 5xx, or a transport failure), following the status table in the
//! specification's external-interfaces section. Everything above this
//! layer — the fault tolerance layer, tier tester, and detector — depends
//! only on the trait, never on `reqwest` directly, which is what lets
//! tests substitute a mock sender instead of hitting the network.

use crate::error::{DetectError, DetectResult};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;

/// A single outbound probe request.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// HTTP method. Defaults to GET via [`ProbeRequest::get`].
    pub method: Method,
    /// Fully-qualified URL (base URL joined with the rotator's chosen
    /// path).
    pub url: String,
    /// Headers to send, already merged with whatever the auth
    /// configuration injects.
    pub headers: HeaderMap,
}

impl ProbeRequest {
    /// Build a GET request to `url` with `headers`.
    pub fn get(url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers,
        }
    }
}

/// A response that reached the application layer: status and headers.
/// No body is retained — the specification requires none for any
/// decision this crate makes.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    /// The HTTP status code.
    pub status: u16,
    /// Response headers, scanned by the header analyzer.
    pub headers: HeaderMap,
}

impl ProbeResponse {
    /// Whether this response is a 2xx success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this response is a 429.
    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    /// Whether this response is a 5xx server error.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Sends one probe request and classifies the result.
///
/// Implementations must not retry internally — retrying is the fault
/// tolerance layer's job, one layer up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeSender: Send + Sync {
    /// Send `request` and classify the response. Returns `Ok` only for a
    /// 2xx status; every other status, and every transport failure,
    /// becomes a classified `Err`.
    async fn send(&self, request: &ProbeRequest) -> DetectResult<ProbeResponse>;
}

/// [`ProbeSender`] backed by a real `reqwest::Client`.
pub struct HttpProbeSender {
    client: reqwest::Client,
}

impl HttpProbeSender {
    /// Build a sender around a fresh client with the given per-call
    /// connect/read behavior left at `reqwest` defaults — the fault
    /// tolerance layer applies its own per-call timeout independently.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Build a sender around a caller-supplied client, e.g. one
    /// preconfigured with a connection pool shared across components.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpProbeSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeSender for HttpProbeSender {
    async fn send(&self, request: &ProbeRequest) -> DetectResult<ProbeResponse> {
        let response = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| {
                DetectError::network_error(format!("request to {} failed: {e}", request.url), Some(Box::new(e)))
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if (200..300).contains(&status) {
            return Ok(ProbeResponse { status, headers });
        }

        Err(DetectError::from_status(
            status,
            format!("{} {}", request.method, request.url),
            request.url.clone(),
            Some(headers),
        ))
    }
}
