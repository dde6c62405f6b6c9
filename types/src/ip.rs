//! Client IP string normalization.

use std::net::IpAddr;

/// Sentinel used when no usable client address can be determined.
pub const UNKNOWN: &str = "unknown";

/// Maximum stored length of an IP string (fits any IPv6 textual form).
pub const MAX_IP_LEN: usize = 45;

/// Normalize a raw address string: trim whitespace, strip an IPv4-mapped
/// IPv6 prefix (`::ffff:1.2.3.4` → `1.2.3.4`), and fall back to
/// [`UNKNOWN`] for empty or oversized input. Never fails.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_IP_LEN {
        return UNKNOWN.to_string();
    }
    let lower = trimmed.to_ascii_lowercase();
    if let Some(mapped) = lower.strip_prefix("::ffff:") {
        if mapped.parse::<std::net::Ipv4Addr>().is_ok() {
            return mapped.to_string();
        }
    }
    lower
}

/// Whether the string parses as a loopback address.
pub fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>().map(|a| a.is_loopback()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mapped_ipv4_prefix() {
        assert_eq!(normalize("::ffff:203.0.113.9"), "203.0.113.9");
        assert_eq!(normalize("::FFFF:203.0.113.9"), "203.0.113.9");
    }

    #[test]
    fn keeps_plain_addresses() {
        assert_eq!(normalize("203.0.113.9"), "203.0.113.9");
        assert_eq!(normalize("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn empty_becomes_unknown() {
        assert_eq!(normalize(""), UNKNOWN);
        assert_eq!(normalize("   "), UNKNOWN);
    }

    #[test]
    fn oversized_becomes_unknown() {
        let long = "a".repeat(MAX_IP_LEN + 1);
        assert_eq!(normalize(&long), UNKNOWN);
    }

    #[test]
    fn mapped_prefix_without_ipv4_kept_verbatim() {
        assert_eq!(normalize("::ffff:nonsense"), "::ffff:nonsense");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(!is_loopback("203.0.113.9"));
        assert!(!is_loopback("unknown"));
    }
}
