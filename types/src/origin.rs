//! Origin classification: public domains vs. local-looking traffic.
//!
//! Every request carries an `Origin` header (or none). Requests from real
//! public web origins are rate-limited per origin; everything else — local
//! tooling, browser extensions, IP literals, malformed hosts — falls back
//! to the per-IP tier. The classifier below is the single source of truth
//! for that routing decision.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Suffixes that mark a host as belonging to a local network.
const LOCAL_SUFFIXES: [&str; 5] = [".local", ".internal", ".lan", ".home", ".localhost"];

/// URL schemes that identify browser-extension origins.
const EXTENSION_SCHEMES: [&str; 4] = [
    "chrome-extension",
    "moz-extension",
    "safari-web-extension",
    "ms-browser-extension",
];

/// How an `Origin` header value is treated by the rate limiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginClass {
    /// A syntactically valid public domain; limited per origin.
    Public,
    /// Local, private, malformed, or absent; limited per client IP.
    LocalLike,
}

impl OriginClass {
    pub fn is_public(self) -> bool {
        self == OriginClass::Public
    }
}

/// Classify an `Origin` header value.
///
/// Returns [`OriginClass::LocalLike`] when the value is empty, names
/// localhost, is a private or loopback address, carries an explicit port,
/// ends in a local-network suffix, uses a `file://` or browser-extension
/// scheme, or is not structurally a valid public DNS name.
pub fn classify(origin: &str) -> OriginClass {
    let raw = origin.trim();
    if raw.is_empty() {
        return OriginClass::LocalLike;
    }

    if let Some((scheme, _)) = raw.split_once("://") {
        let scheme = scheme.to_ascii_lowercase();
        if scheme == "file" || EXTENSION_SCHEMES.contains(&scheme.as_str()) {
            return OriginClass::LocalLike;
        }
    }

    let host = host_of(raw).to_ascii_lowercase();
    if host.is_empty() {
        return OriginClass::LocalLike;
    }

    // Any colon means an explicit port or an IPv6 literal; neither is a
    // public domain. This also catches `::1`.
    if host.contains(':') {
        return OriginClass::LocalLike;
    }

    if host == "localhost" || host.starts_with("localhost.") {
        return OriginClass::LocalLike;
    }

    if LOCAL_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        return OriginClass::LocalLike;
    }

    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        if addr.is_private() || addr.is_loopback() {
            return OriginClass::LocalLike;
        }
        // A bare public IPv4 still fails the domain test below (numeric
        // TLD), so fall through for uniform handling.
    }

    if !is_valid_public_domain(&host) {
        return OriginClass::LocalLike;
    }

    OriginClass::Public
}

/// Strip the scheme and any path or trailing slashes from an origin value,
/// leaving the bare host (plus port, if one was present).
///
/// `https://example.com/` becomes `example.com`. Values without a scheme
/// pass through with only path/slash stripping.
pub fn clean(origin: &str) -> String {
    let raw = origin.trim();
    let without_scheme = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    let host_and_port = match without_scheme.split_once('/') {
        Some((head, _)) => head,
        None => without_scheme,
    };
    host_and_port.trim_end_matches('/').to_ascii_lowercase()
}

/// Extract the host (possibly with port) from an origin value.
fn host_of(raw: &str) -> &str {
    let without_scheme = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };
    match without_scheme.split_once('/') {
        Some((head, _)) => head,
        None => without_scheme,
    }
}

/// Structural validation of a public DNS name.
///
/// Requires at least two labels. Each label is 1–63 characters of
/// letters, digits, and hyphens, with no hyphen at either end. The final
/// label (the TLD) must be purely alphabetic and at least two characters.
fn is_valid_public_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_domain_is_public() {
        assert_eq!(classify("https://example.com"), OriginClass::Public);
        assert_eq!(classify("https://app.example.co.uk/"), OriginClass::Public);
        assert_eq!(classify("example.com"), OriginClass::Public);
    }

    #[test]
    fn empty_origin_is_local() {
        assert_eq!(classify(""), OriginClass::LocalLike);
        assert_eq!(classify("   "), OriginClass::LocalLike);
    }

    #[test]
    fn localhost_variants_are_local() {
        assert_eq!(classify("http://localhost"), OriginClass::LocalLike);
        assert_eq!(classify("http://localhost:3000"), OriginClass::LocalLike);
        assert_eq!(classify("localhost.dev"), OriginClass::LocalLike);
        assert_eq!(classify("app.localhost"), OriginClass::LocalLike);
    }

    #[test]
    fn private_and_loopback_ips_are_local() {
        assert_eq!(classify("http://10.0.0.5"), OriginClass::LocalLike);
        assert_eq!(classify("http://172.16.1.1"), OriginClass::LocalLike);
        assert_eq!(classify("http://192.168.1.10"), OriginClass::LocalLike);
        assert_eq!(classify("http://127.0.0.1"), OriginClass::LocalLike);
        assert_eq!(classify("http://[::1]"), OriginClass::LocalLike);
    }

    #[test]
    fn public_ip_literal_is_still_local() {
        // No alphabetic TLD, so it fails the domain test.
        assert_eq!(classify("http://8.8.8.8"), OriginClass::LocalLike);
    }

    #[test]
    fn explicit_port_is_local() {
        assert_eq!(classify("https://example.com:8545"), OriginClass::LocalLike);
    }

    #[test]
    fn local_network_suffixes_are_local() {
        assert_eq!(classify("http://nas.local"), OriginClass::LocalLike);
        assert_eq!(classify("http://api.internal"), OriginClass::LocalLike);
        assert_eq!(classify("http://router.lan"), OriginClass::LocalLike);
        assert_eq!(classify("http://printer.home"), OriginClass::LocalLike);
    }

    #[test]
    fn extension_and_file_schemes_are_local() {
        assert_eq!(
            classify("chrome-extension://abcdefghijklmnop"),
            OriginClass::LocalLike
        );
        assert_eq!(
            classify("moz-extension://uuid-here"),
            OriginClass::LocalLike
        );
        assert_eq!(classify("file:///home/user/index.html"), OriginClass::LocalLike);
    }

    #[test]
    fn structurally_invalid_hosts_are_local() {
        assert_eq!(classify("https://example"), OriginClass::LocalLike);
        assert_eq!(classify("https://-bad.com"), OriginClass::LocalLike);
        assert_eq!(classify("https://bad-.com"), OriginClass::LocalLike);
        assert_eq!(classify("https://exa_mple.com"), OriginClass::LocalLike);
        assert_eq!(classify("https://example.c"), OriginClass::LocalLike);
        assert_eq!(classify("https://example.123"), OriginClass::LocalLike);
        assert_eq!(classify("https://example..com"), OriginClass::LocalLike);
    }

    #[test]
    fn label_length_limit_enforced() {
        let long_label = "a".repeat(64);
        assert_eq!(
            classify(&format!("https://{long_label}.com")),
            OriginClass::LocalLike
        );
        let max_label = "a".repeat(63);
        assert_eq!(
            classify(&format!("https://{max_label}.com")),
            OriginClass::Public
        );
    }

    #[test]
    fn unknown_sentinel_is_local() {
        assert_eq!(classify("unknown"), OriginClass::LocalLike);
    }

    #[test]
    fn clean_strips_scheme_and_slash() {
        assert_eq!(clean("https://example.com/"), "example.com");
        assert_eq!(clean("http://Example.COM"), "example.com");
        assert_eq!(clean("example.com"), "example.com");
        assert_eq!(clean("https://example.com/path/x"), "example.com");
    }

    #[test]
    fn clean_preserves_port() {
        assert_eq!(clean("http://localhost:3000/"), "localhost:3000");
    }
}
