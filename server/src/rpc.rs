//! The JSON-RPC forwarding pipeline: `POST /` and the `GET /` probe.
//!
//! Admission order is fixed: identity → blacklist → validation →
//! rate limit → dispatch. Every rejection is answered as HTTP 200 with a
//! JSON-RPC error body and recorded in the reject log; only upstream
//! failures surface non-200 statuses. The aggregator is credited only
//! for successful primary-mode forwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, warn};

use palisade_admission::{client_ip, request_origin, validate_body};
use palisade_types::rpc::{
    RpcErrorResponse, CODE_INVALID_REQUEST, CODE_PARSE_ERROR, CODE_RATE_LIMITED,
};
use palisade_types::RpcPayload;

use crate::state::ProxyState;

/// Answer a rejection: HTTP 200, JSON-RPC error body, reject-log line.
fn reject(
    state: &ProxyState,
    ip: &str,
    origin: &str,
    reason: &str,
    body_text: &str,
    response: RpcErrorResponse,
) -> Response {
    state.metrics.requests_rejected.inc();
    state.reject_log.log(ip, origin, reason, body_text);
    (StatusCode::OK, Json(response)).into_response()
}

pub async fn handle_rpc(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metrics.requests_received.inc();
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let ip = client_ip(&headers, peer);
    let origin = request_origin(&headers);
    let body_text = String::from_utf8_lossy(&body).into_owned();

    // Blacklist gates before anything else, including validation.
    if state.blacklist.is_blacklisted(&ip) {
        debug!(%ip, "blacklisted ip rejected");
        return reject(
            &state,
            &ip,
            &origin,
            "blacklisted ip",
            &body_text,
            RpcErrorResponse::new(Value::Null, CODE_INVALID_REQUEST, "IP address is blocked."),
        );
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return reject(
                &state,
                &ip,
                &origin,
                "unparseable body",
                &body_text,
                RpcErrorResponse::new(Value::Null, CODE_PARSE_ERROR, "Parse error"),
            );
        }
    };

    let payload = match validate_body(&parsed) {
        Ok(payload) => payload,
        Err(rpc_reject) => {
            let reason = rpc_reject.message.clone();
            return reject(
                &state,
                &ip,
                &origin,
                &reason,
                &body_text,
                RpcErrorResponse::new(rpc_reject.id, rpc_reject.code, rpc_reject.message),
            );
        }
    };

    if let Some(denial) = state.limiter.check(&ip, &origin) {
        state.metrics.requests_rate_limited.inc();
        state.reject_log.log(&ip, &origin, &denial.reason, &body_text);
        let response = RpcErrorResponse::new(
            payload.primary_id(),
            CODE_RATE_LIMITED,
            "Rate limit exceeded.",
        )
        .with_data(json!({ "retryAfter": denial.retry_after_secs }));
        return (StatusCode::OK, Json(response)).into_response();
    }

    forward(&state, &ip, &origin, &payload, &headers, body).await
}

async fn forward(
    state: &ProxyState,
    ip: &str,
    origin: &str,
    payload: &RpcPayload,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    match state.upstream.forward_post(headers, body.to_vec()).await {
        Ok(outcome) => {
            state
                .metrics
                .forward_latency_ms
                .observe(started.elapsed().as_secs_f64() * 1_000.0);
            if outcome.used_fallback {
                state.metrics.fallback_responses.inc();
            } else {
                state.metrics.requests_forwarded.inc();
                // Fallback traffic is never billed; primary successes
                // credit the whole batch in one call.
                state
                    .aggregator
                    .credit(ip, origin, payload.call_count() as u64);
            }
            upstream_response(outcome.status, outcome.body)
        }
        Err(err) => {
            state.metrics.upstream_failures.inc();
            warn!(%ip, %err, "request failed on every upstream");
            let status = StatusCode::from_u16(err.response_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.to_string()).into_response()
        }
    }
}

/// Relay an upstream body verbatim.
fn upstream_response(status: u16, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// `GET /`: probe the primary, falling through to the fallback. Purely
/// diagnostic; never touches the breaker or the aggregator.
pub async fn handle_probe(State(state): State<Arc<ProxyState>>) -> Response {
    match state.upstream.probe_get().await {
        Ok(probe) => {
            let status = StatusCode::from_u16(probe.status).unwrap_or(StatusCode::OK);
            (status, probe.body).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}
