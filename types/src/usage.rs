//! In-memory usage aggregates and persisted counter rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::origin;

/// Per-origin request counts, keyed by bare-host origin.
pub type OriginCounts = HashMap<String, u64>;

/// Requests attributed to one client IP during an aggregation window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpUsage {
    /// Total requests from this IP, regardless of origin.
    pub count: u64,
    /// Requests broken down by public origin. LocalLike traffic is counted
    /// in `count` only.
    pub origins: OriginCounts,
}

impl IpUsage {
    /// ADD-merge another usage record into this one.
    pub fn merge(&mut self, other: &IpUsage) {
        self.count += other.count;
        merge_add(&mut self.origins, &other.origins);
    }
}

/// ADD-merge: overlapping keys have their counts summed, keys present in
/// only one map are copied through.
pub fn merge_add(dst: &mut OriginCounts, src: &OriginCounts) {
    for (key, n) in src {
        *dst.entry(key.clone()).or_insert(0) += n;
    }
}

/// Drop every origin key classified LocalLike, keeping only public
/// domains. Idempotent: filtering a filtered map is a no-op.
pub fn filter_public_origins(map: &OriginCounts) -> OriginCounts {
    map.iter()
        .filter(|(key, _)| origin::classify(key).is_public())
        .map(|(key, n)| (key.clone(), *n))
        .collect()
}

/// One row of the persisted per-IP counter table.
///
/// Counts are `i64` to match the `BIGINT` storage columns; timestamps are
/// epoch seconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CounterRow {
    pub ip: String,
    pub requests_total: i64,
    pub requests_last_hour: i64,
    pub requests_previous_hour: i64,
    pub requests_today: i64,
    pub requests_this_month: i64,
    /// All-time per-origin counts.
    pub origins: HashMap<String, i64>,
    pub origins_last_hour: HashMap<String, i64>,
    pub origins_previous_hour: HashMap<String, i64>,
    pub origins_today: HashMap<String, i64>,
    /// Start of the hour window this row was last reset into.
    pub last_reset_timestamp: i64,
    pub last_day_reset_timestamp: i64,
    pub last_month_reset_timestamp: i64,
    pub updated_at: i64,
}

/// One hourly snapshot row in the history table; unique per
/// `(hour_timestamp, ip)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRow {
    pub hour_timestamp: i64,
    pub ip: String,
    pub request_count: i64,
    pub origins: HashMap<String, i64>,
}
