//! Key-guarded read-only admin endpoints.
//!
//! Authorization is a constant-time comparison of the `X-Admin-Key`
//! header against the configured key. No key configured means the whole
//! admin surface answers 403; a missing header is 401; a mismatch is
//! 403. `/watchdog` is the only unauthenticated route.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;

use palisade_utils::time;

use crate::state::ProxyState;

/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Constant-time admin key check.
fn authorize(state: &ProxyState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "admin interface disabled" })),
        )
            .into_response());
    };

    let Some(provided) = headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing admin key" })),
        )
            .into_response());
    };

    // Length equality leaks only the key length; the byte comparison is
    // constant time.
    let matches = provided.len() == expected.len()
        && provided.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid admin key" })),
        )
            .into_response());
    }
    Ok(())
}

/// `GET /watchdog` — liveness, no auth.
pub async fn watchdog() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// `GET /status` — breaker snapshot.
pub async fn breaker_status(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let now = time::unix_now();
    Json(json!({
        "breaker": state.breaker.snapshot(),
        "uptimeSecs": now.saturating_sub(state.started_at),
        "aggregator": state.aggregator.snapshot(),
    }))
    .into_response()
}

/// `GET /ratelimitstatus` — limiter snapshot, configured limits, and
/// sliding-window diagnostics.
pub async fn rate_limit_status(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let snapshot = state.limiter.snapshot();
    let now = time::unix_now();
    Json(json!({
        "slidingWindow": {
            "previousHourWeight": snapshot.previous_hour_weight,
            "secondsToNextHour": time::secs_to_next_hour(now),
            "secondsToNextMidnight": time::secs_to_next_midnight(now),
        },
        "refreshedAt": snapshot.refreshed_at,
        "capabilities": snapshot.capabilities,
        "limits": state.limiter.config(),
        "summary": {
            "blockedOriginsHourly": snapshot.blocked_origins_hourly.len(),
            "blockedOriginsDaily": snapshot.blocked_origins_daily.len(),
            "blockedIpsHourly": snapshot.blocked_ips_hourly.len(),
            "blockedIpsDaily": snapshot.blocked_ips_daily.len(),
            "trackedOrigins": snapshot.origin_counts.len(),
            "trackedIps": snapshot.ip_counts.len(),
        },
        "blocked": {
            "originsHourly": snapshot.blocked_origins_hourly,
            "originsDaily": snapshot.blocked_origins_daily,
            "ipsHourly": snapshot.blocked_ips_hourly,
            "ipsDaily": snapshot.blocked_ips_daily,
        },
        "origins": snapshot.origin_counts,
        "originsDaily": snapshot.origin_daily_counts,
        "ips": snapshot.ip_counts,
        "ipsDaily": snapshot.ip_daily_counts,
    }))
    .into_response()
}

/// `GET /blackliststatus` — blacklist snapshot.
pub async fn blacklist_status(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    Json(state.blacklist.snapshot()).into_response()
}
