//! Client IP and origin extraction from untrusted headers.

use std::net::SocketAddr;

use http::HeaderMap;

use palisade_types::ip;

/// Proxy headers consulted for the client address, in trust order.
/// `X-Forwarded-For` is special-cased: only its first entry counts.
const IP_HEADERS: [&str; 5] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-forwarded-for",
    "x-real-ip",
    "fastly-client-ip",
];

/// Extract the client IP from proxy headers, falling back to the
/// transport peer address and finally to `unknown`. Must never fail a
/// request: any unusable value just moves to the next candidate.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in IP_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let candidate = if name == "x-forwarded-for" {
                value.split(',').next().unwrap_or("")
            } else {
                value
            };
            let normalized = ip::normalize(candidate);
            if normalized != ip::UNKNOWN {
                return normalized;
            }
        }
    }
    match peer {
        Some(addr) => ip::normalize(&addr.ip().to_string()),
        None => ip::UNKNOWN.to_string(),
    }
}

/// The `Origin` header verbatim, or `unknown` when absent or unreadable.
pub fn request_origin(headers: &HeaderMap) -> String {
    headers
        .get(http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| ip::UNKNOWN.to_string())
}
