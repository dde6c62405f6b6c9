//! Forwarding of validated requests to the selected upstream.
//!
//! The dispatcher asks the breaker where a POST should go, applies the
//! per-path timeout budget, performs the single immediate fallback retry
//! on primary failure, and reports POST outcomes back to the breaker.
//! The HTTP client is constructed once and reused for every request.

use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, RouteChoice};
use crate::error::UpstreamError;

/// Request headers never forwarded upstream.
const HOP_HEADERS: [&str; 7] = [
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Dispatcher tuning. The fallback budget is deliberately wider than the
/// primary budget so a slow-but-alive fallback still answers.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    /// Budget for a primary POST.
    pub request_timeout: Duration,
    /// Total budget for a fallback POST.
    pub fallback_timeout: Duration,
    /// Accept self-signed or otherwise unverifiable upstream
    /// certificates. Only for upstreams the operator controls.
    pub accept_invalid_certs: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            fallback_url: None,
            request_timeout: Duration::from_secs(10),
            fallback_timeout: Duration::from_secs(15),
            accept_invalid_certs: false,
        }
    }
}

/// The result of a forwarded POST.
#[derive(Clone, Debug)]
pub struct ForwardOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    /// Whether the fallback answered — either because the breaker was
    /// open or because the immediate retry kicked in. Fallback-served
    /// requests are never credited to the aggregator.
    pub used_fallback: bool,
}

/// The result of a diagnostic GET probe.
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    pub via_fallback: bool,
}

/// Seam between the HTTP handler and the real dispatcher; lets the
/// request pipeline be exercised without a network.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward_post(
        &self,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<ForwardOutcome, UpstreamError>;

    async fn probe_get(&self) -> Result<ProbeOutcome, UpstreamError>;
}

pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatcherConfig,
    breaker: std::sync::Arc<CircuitBreaker>,
}

/// What a single upstream attempt produced, before breaker bookkeeping.
struct AttemptFailure {
    status: Option<u16>,
    message: String,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        breaker: std::sync::Arc<CircuitBreaker>,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| UpstreamError::Primary(e.to_string()))?;
        Ok(Self {
            client,
            config,
            breaker,
        })
    }

    /// POST `body` to `url` with the client's headers (hop headers
    /// stripped, content type forced).
    async fn post_primary(
        &self,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), AttemptFailure> {
        let mut forwarded = HeaderMap::new();
        for (name, value) in headers {
            if !HOP_HEADERS.contains(&name.as_str()) {
                forwarded.append(name.clone(), value.clone());
            }
        }
        forwarded.insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));

        self.post(
            &self.config.primary_url,
            forwarded,
            body,
            self.config.request_timeout,
        )
        .await
    }

    /// POST `body` to the fallback with a sanitized header set: JSON
    /// content type plus the client's user agent, nothing else.
    async fn post_fallback(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), AttemptFailure> {
        let mut sanitized = HeaderMap::new();
        sanitized.insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
        if let Some(agent) = headers.get(USER_AGENT) {
            sanitized.insert(USER_AGENT, agent.clone());
        }
        self.post(url, sanitized, body, self.config.fallback_timeout)
            .await
    }

    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<(u16, Vec<u8>), AttemptFailure> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AttemptFailure {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| AttemptFailure {
            status: Some(status.as_u16()),
            message: e.to_string(),
        })?;

        if status.is_success() {
            Ok((status.as_u16(), bytes.to_vec()))
        } else {
            Err(AttemptFailure {
                status: Some(status.as_u16()),
                message: format!("upstream answered {status}"),
            })
        }
    }
}

#[async_trait]
impl Upstream for Dispatcher {
    async fn forward_post(
        &self,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<ForwardOutcome, UpstreamError> {
        // Breaker open: straight to the fallback, response returned
        // verbatim, no breaker bookkeeping.
        if self.breaker.route() == RouteChoice::Fallback {
            if let Some(url) = self.config.fallback_url.clone() {
                return match self.post_fallback(&url, headers, body).await {
                    Ok((status, bytes)) => Ok(ForwardOutcome {
                        status,
                        body: bytes,
                        used_fallback: true,
                    }),
                    Err(failure) => Err(UpstreamError::Exhausted {
                        status: failure.status,
                        message: failure.message,
                    }),
                };
            }
        }

        match self.post_primary(headers, body.clone()).await {
            Ok((status, bytes)) => {
                self.breaker.on_success();
                Ok(ForwardOutcome {
                    status,
                    body: bytes,
                    used_fallback: false,
                })
            }
            Err(primary_failure) => {
                self.breaker.on_failure();
                debug!(
                    status = ?primary_failure.status,
                    "primary upstream failed, attempting fallback retry"
                );

                let Some(url) = self.config.fallback_url.clone() else {
                    return Err(UpstreamError::Exhausted {
                        status: primary_failure.status,
                        message: primary_failure.message,
                    });
                };

                // One immediate retry, sanitized headers, wider budget.
                match self.post_fallback(&url, headers, body).await {
                    Ok((status, bytes)) => Ok(ForwardOutcome {
                        status,
                        body: bytes,
                        used_fallback: true,
                    }),
                    Err(fallback_failure) => {
                        warn!(
                            primary = %primary_failure.message,
                            fallback = %fallback_failure.message,
                            "both upstreams failed"
                        );
                        Err(UpstreamError::Exhausted {
                            status: primary_failure.status.or(fallback_failure.status),
                            message: format!(
                                "primary: {}; fallback: {}",
                                primary_failure.message, fallback_failure.message
                            ),
                        })
                    }
                }
            }
        }
    }

    /// GET probe: try the primary, fall through to the fallback on a
    /// transport error. Neither outcome feeds the breaker; RPC nodes
    /// routinely 404 plain GETs.
    async fn probe_get(&self) -> Result<ProbeOutcome, UpstreamError> {
        let primary = self
            .client
            .get(&self.config.primary_url)
            .timeout(self.config.request_timeout)
            .send()
            .await;

        match primary {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                Ok(ProbeOutcome {
                    status,
                    body,
                    via_fallback: false,
                })
            }
            Err(primary_err) => {
                let Some(url) = self.config.fallback_url.clone() else {
                    return Err(UpstreamError::Primary(primary_err.to_string()));
                };
                let response = self
                    .client
                    .get(&url)
                    .timeout(self.config.fallback_timeout)
                    .send()
                    .await
                    .map_err(|e| UpstreamError::Exhausted {
                        status: None,
                        message: format!("primary: {primary_err}; fallback: {e}"),
                    })?;
                let status = response.status().as_u16();
                let body = response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                Ok(ProbeOutcome {
                    status,
                    body,
                    via_fallback: true,
                })
            }
        }
    }
}
