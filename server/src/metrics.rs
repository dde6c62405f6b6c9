//! Prometheus metrics for the proxy.
//!
//! The [`ProxyMetrics`] struct owns a dedicated [`Registry`] that the
//! `/metrics` endpoint encodes into the text exposition format.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, HistogramOpts, IntCounter, IntGauge, Opts,
    Registry,
};

use crate::state::ProxyState;

/// Central collection of all proxy-level Prometheus metrics.
pub struct ProxyMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Total JSON-RPC POSTs received.
    pub requests_received: IntCounter,
    /// Requests forwarded to the primary and answered successfully.
    pub requests_forwarded: IntCounter,
    /// Requests rejected at admission (parse, validation, namespace,
    /// blacklist).
    pub requests_rejected: IntCounter,
    /// Requests denied by the rate limiter.
    pub requests_rate_limited: IntCounter,
    /// Responses served by the fallback upstream.
    pub fallback_responses: IntCounter,
    /// Requests that failed on every upstream.
    pub upstream_failures: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Current number of blacklisted IPs.
    pub blacklist_entries: IntGauge,
    /// Entities currently blocked by the rate limiter, all tiers.
    pub blocked_entities: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Upstream forward latency, in milliseconds.
    pub forward_latency_ms: Histogram,
}

impl ProxyMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_received = register_int_counter_with_registry!(
            Opts::new("palisade_requests_received_total", "Total JSON-RPC POSTs received"),
            registry
        )
        .expect("failed to register requests_received counter");

        let requests_forwarded = register_int_counter_with_registry!(
            Opts::new(
                "palisade_requests_forwarded_total",
                "Requests served by the primary upstream"
            ),
            registry
        )
        .expect("failed to register requests_forwarded counter");

        let requests_rejected = register_int_counter_with_registry!(
            Opts::new(
                "palisade_requests_rejected_total",
                "Requests rejected at admission"
            ),
            registry
        )
        .expect("failed to register requests_rejected counter");

        let requests_rate_limited = register_int_counter_with_registry!(
            Opts::new(
                "palisade_requests_rate_limited_total",
                "Requests denied by the rate limiter"
            ),
            registry
        )
        .expect("failed to register requests_rate_limited counter");

        let fallback_responses = register_int_counter_with_registry!(
            Opts::new(
                "palisade_fallback_responses_total",
                "Responses served by the fallback upstream"
            ),
            registry
        )
        .expect("failed to register fallback_responses counter");

        let upstream_failures = register_int_counter_with_registry!(
            Opts::new(
                "palisade_upstream_failures_total",
                "Requests that failed on every upstream"
            ),
            registry
        )
        .expect("failed to register upstream_failures counter");

        let blacklist_entries = register_int_gauge_with_registry!(
            Opts::new("palisade_blacklist_entries", "Current blacklisted IP count"),
            registry
        )
        .expect("failed to register blacklist_entries gauge");

        let blocked_entities = register_int_gauge_with_registry!(
            Opts::new(
                "palisade_blocked_entities",
                "Entities currently blocked by the rate limiter"
            ),
            registry
        )
        .expect("failed to register blocked_entities gauge");

        let forward_latency_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "palisade_forward_latency_ms",
                "Upstream forward latency in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register forward_latency_ms histogram");

        Self {
            registry,
            requests_received,
            requests_forwarded,
            requests_rejected,
            requests_rate_limited,
            fallback_responses,
            upstream_failures,
            blacklist_entries,
            blocked_entities,
            forward_latency_ms,
        }
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ── Prometheus metrics endpoint ──────────────────────────────────────────

pub async fn metrics_handler(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};

    // Refresh point-in-time gauges right before scraping.
    state
        .metrics
        .blacklist_entries
        .set(state.blacklist.snapshot().entry_count as i64);
    state
        .metrics
        .blocked_entities
        .set(state.limiter.snapshot().blocked_total() as i64);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type())],
        buffer,
    )
        .into_response()
}
