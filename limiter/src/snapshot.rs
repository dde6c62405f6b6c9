//! Immutable limiter state, fully rebuilt on every poll.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use palisade_store::StoreCapabilities;

/// Sliding-window counts kept for diagnostics alongside the block sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct WindowDiag {
    pub current: i64,
    pub previous: i64,
    pub effective: f64,
}

/// One poll's worth of limiter state. Swapped in atomically; request
/// threads never see a partially built snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LimiterSnapshot {
    /// Origins over their hourly sliding-window limit.
    pub blocked_origins_hourly: HashSet<String>,
    /// Origins over their daily cap.
    pub blocked_origins_daily: HashSet<String>,
    /// IPs over their hourly sliding-window limit.
    pub blocked_ips_hourly: HashSet<String>,
    /// IPs over their daily cap.
    pub blocked_ips_daily: HashSet<String>,

    /// Per-origin window counts, for the admin surface.
    pub origin_counts: HashMap<String, WindowDiag>,
    /// Per-IP window counts, for the admin surface.
    pub ip_counts: HashMap<String, WindowDiag>,
    /// Per-origin counts for the current UTC day.
    pub origin_daily_counts: HashMap<String, i64>,
    /// Per-IP counts for the current UTC day.
    pub ip_daily_counts: HashMap<String, i64>,

    /// Weight applied to previous-hour counts when this snapshot was
    /// built.
    pub previous_hour_weight: f64,
    /// Epoch seconds of the successful poll that built this snapshot;
    /// zero for the initial empty snapshot.
    pub refreshed_at: u64,
    /// Schema capabilities in effect when the snapshot was built.
    pub capabilities: StoreCapabilities,
}

impl LimiterSnapshot {
    /// Total number of blocked entities across all four sets.
    pub fn blocked_total(&self) -> usize {
        self.blocked_origins_hourly.len()
            + self.blocked_origins_daily.len()
            + self.blocked_ips_hourly.len()
            + self.blocked_ips_daily.len()
    }
}
