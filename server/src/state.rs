//! Shared state accessible by all handlers.

use std::sync::Arc;

use palisade_admission::{IpBlacklist, RejectLog};
use palisade_aggregator::UsageAggregator;
use palisade_limiter::RateLimiter;
use palisade_upstream::{CircuitBreaker, Upstream};

use crate::metrics::ProxyMetrics;

/// Everything a request handler needs. One instance per process,
/// constructed by the daemon and shared via `Arc`.
pub struct ProxyState {
    /// Dispatcher behind its seam trait; tests substitute a mock.
    pub upstream: Arc<dyn Upstream>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub blacklist: Arc<IpBlacklist>,
    pub aggregator: Arc<UsageAggregator>,
    pub reject_log: RejectLog,
    pub metrics: Arc<ProxyMetrics>,
    /// Admin endpoint key; `None` disables the admin surface.
    pub admin_key: Option<String>,
    /// Unix timestamp (seconds) when the proxy started.
    pub started_at: u64,
}
