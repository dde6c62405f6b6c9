//! Sliding-window rate limiter backed by the counter store.
//!
//! The limiter never queries the store on the request path. A background
//! poll loop (see [`poll`]) periodically rebuilds an immutable
//! [`LimiterSnapshot`] from the store and swaps it in atomically; request
//! threads only read the current snapshot. Public origins are limited per
//! origin, everything else per client IP, with a daily cap consulted
//! before the hourly sliding window.

pub mod poll;
pub mod snapshot;

use std::sync::{Arc, RwLock};

use serde::Serialize;

use palisade_types::origin::{self, OriginClass};
use palisade_utils::time;

pub use snapshot::LimiterSnapshot;

/// Configured request ceilings. A limit of zero disables that tier.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RateLimitConfig {
    /// Sliding-window ceiling for requests from one public origin.
    pub origin_hourly_limit: u64,
    /// Sliding-window ceiling for requests from one IP (LocalLike tier).
    pub ip_hourly_limit: u64,
    /// Midnight-UTC cap per public origin.
    pub origin_daily_limit: u64,
    /// Midnight-UTC cap per IP.
    pub ip_daily_limit: u64,
    /// Poll cadence for refreshing limiter state, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            origin_hourly_limit: 0,
            ip_hourly_limit: 0,
            origin_daily_limit: 0,
            ip_daily_limit: 0,
            poll_interval_secs: 10,
        }
    }
}

/// Why a request was denied, and when the client may retry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: String,
    /// Seconds until the relevant window resets.
    pub retry_after_secs: u64,
}

/// Shared rate-limiter handle: a config plus the current snapshot.
pub struct RateLimiter {
    config: RateLimitConfig,
    snapshot: RwLock<Arc<LimiterSnapshot>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(LimiterSnapshot::default())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<LimiterSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => Arc::new(LimiterSnapshot::default()),
        }
    }

    /// Atomically replace the snapshot; called by the poll loop only.
    pub fn install(&self, snapshot: LimiterSnapshot) {
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Arc::new(snapshot);
        }
    }

    /// Answer allow/deny for one request.
    ///
    /// Public origins consult the origin-scoped tiers (daily before
    /// hourly); LocalLike traffic consults the IP-scoped tiers. Any
    /// internal error answers "not limited".
    pub fn check(&self, client_ip: &str, request_origin: &str) -> Option<Denial> {
        let snapshot = self.snapshot();
        let now = time::unix_now();
        match origin::classify(request_origin) {
            OriginClass::Public => {
                let key = origin::clean(request_origin);
                if snapshot.blocked_origins_daily.contains(&key) {
                    return Some(Denial {
                        reason: format!("origin '{key}' exceeded its daily limit"),
                        retry_after_secs: time::secs_to_next_midnight(now),
                    });
                }
                if snapshot.blocked_origins_hourly.contains(&key) {
                    return Some(Denial {
                        reason: format!("origin '{key}' exceeded its hourly limit"),
                        retry_after_secs: time::secs_to_next_hour(now),
                    });
                }
                None
            }
            OriginClass::LocalLike => {
                if snapshot.blocked_ips_daily.contains(client_ip) {
                    return Some(Denial {
                        reason: format!("ip '{client_ip}' exceeded its daily limit"),
                        retry_after_secs: time::secs_to_next_midnight(now),
                    });
                }
                if snapshot.blocked_ips_hourly.contains(client_ip) {
                    return Some(Denial {
                        reason: format!("ip '{client_ip}' exceeded its hourly limit"),
                        retry_after_secs: time::secs_to_next_hour(now),
                    });
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(snapshot: LimiterSnapshot) -> RateLimiter {
        let limiter = RateLimiter::new(RateLimitConfig {
            origin_hourly_limit: 10,
            ip_hourly_limit: 10,
            origin_daily_limit: 100,
            ip_daily_limit: 100,
            poll_interval_secs: 10,
        });
        limiter.install(snapshot);
        limiter
    }

    #[test]
    fn fresh_limiter_blocks_nobody() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        assert_eq!(limiter.check("1.2.3.4", "https://example.com"), None);
        assert_eq!(limiter.check("1.2.3.4", "unknown"), None);
    }

    #[test]
    fn public_origin_uses_origin_tier() {
        let mut snapshot = LimiterSnapshot::default();
        snapshot.blocked_origins_hourly.insert("example.com".into());
        // IP block must not affect a public-origin request.
        snapshot.blocked_ips_hourly.insert("1.2.3.4".into());
        let limiter = limiter_with(snapshot);

        let denial = limiter.check("1.2.3.4", "https://example.com/").unwrap();
        assert!(denial.reason.contains("example.com"));
        assert!(denial.retry_after_secs <= 3_600);

        assert!(limiter.check("1.2.3.4", "https://other.test").is_none());
    }

    #[test]
    fn local_like_uses_ip_tier() {
        let mut snapshot = LimiterSnapshot::default();
        snapshot.blocked_ips_hourly.insert("1.2.3.4".into());
        let limiter = limiter_with(snapshot);

        let denial = limiter.check("1.2.3.4", "http://localhost:3000").unwrap();
        assert!(denial.reason.contains("1.2.3.4"));
        assert!(limiter.check("5.6.7.8", "unknown").is_none());
    }

    #[test]
    fn daily_block_wins_over_hourly() {
        let mut snapshot = LimiterSnapshot::default();
        snapshot.blocked_origins_hourly.insert("example.com".into());
        snapshot.blocked_origins_daily.insert("example.com".into());
        let limiter = limiter_with(snapshot);

        let denial = limiter.check("1.2.3.4", "https://example.com").unwrap();
        assert!(denial.reason.contains("daily"));
        assert!(denial.retry_after_secs <= 86_400);
    }

    #[test]
    fn blocked_origin_key_is_cleaned() {
        let mut snapshot = LimiterSnapshot::default();
        snapshot.blocked_origins_hourly.insert("example.com".into());
        let limiter = limiter_with(snapshot);
        // Scheme and trailing slash are stripped before lookup.
        assert!(limiter.check("1.2.3.4", "https://example.com/").is_some());
    }
}
