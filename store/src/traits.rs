//! The counter-store trait consumed by the aggregator flush loop, the
//! rate-limiter poll loop, and the admin surface.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use palisade_types::{CounterRow, HistoryRow, IpUsage};

use crate::{StoreCapabilities, StoreError};

/// Sliding-window counts for one origin or IP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowCount {
    pub key: String,
    /// Requests in the current (open) hour.
    pub current: i64,
    /// Requests in the previous (closed) hour.
    pub previous: i64,
    /// `current + previous × weight`, as computed by the backend.
    pub effective: f64,
}

/// Current-UTC-day count for one origin or IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub key: String,
    pub count: i64,
}

/// Persistent per-IP request counters with the hourly/daily/monthly reset
/// protocol.
///
/// `apply_usage` owns the reset protocol: every invocation first rolls any
/// crossed month/day/hour boundaries (snapshotting the closed hour into
/// history before zeroing it), then upserts the supplied aggregates. The
/// query methods feed the rate limiter's poll loop.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Detected schema capabilities. Cached by implementations; cheap to
    /// call repeatedly.
    async fn capabilities(&self) -> Result<StoreCapabilities, StoreError>;

    /// Roll window boundaries, then atomically upsert one aggregation
    /// cycle's worth of per-IP usage. Called even when `usage` is empty so
    /// resets still fire on idle deployments. Per-IP failures are logged
    /// and skipped; a batch-level failure propagates so the caller can
    /// merge the aggregates back.
    async fn apply_usage(&self, usage: &HashMap<String, IpUsage>) -> Result<(), StoreError>;

    /// Per-origin sliding-window counts, ordered by effective count
    /// descending, at most `cap` rows.
    async fn origin_hourly_counts(
        &self,
        weight: f64,
        cap: i64,
    ) -> Result<Vec<WindowCount>, StoreError>;

    /// Per-IP sliding-window counts, ordered by effective count
    /// descending, at most `cap` rows.
    async fn ip_hourly_counts(&self, weight: f64, cap: i64)
        -> Result<Vec<WindowCount>, StoreError>;

    /// Per-origin counts for the current UTC day, descending, at most
    /// `cap` rows. Empty when the schema lacks daily columns.
    async fn origin_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError>;

    /// Per-IP counts for the current UTC day, descending, at most `cap`
    /// rows. Empty when the schema lacks daily columns.
    async fn ip_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError>;

    /// Fetch one counter row, if present.
    async fn counter_row(&self, ip: &str) -> Result<Option<CounterRow>, StoreError>;

    /// History snapshots recorded for one IP, newest first.
    async fn history_for_ip(&self, ip: &str) -> Result<Vec<HistoryRow>, StoreError>;
}
