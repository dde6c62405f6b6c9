//! Runtime-detected schema capabilities.

use serde::{Deserialize, Serialize};

/// What the underlying schema supports, detected once per process and
/// cached. Absence of a capability selects a documented degraded mode
/// rather than an error: no sliding-window columns means fixed-window
/// limits, no ADD-merge helper means last-write-wins origin merges, no
/// daily columns means no daily caps or monthly tracking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// `requests_previous_hour` / `origins_previous_hour` columns exist.
    pub sliding_window: bool,
    /// `requests_today` / `origins_today` / monthly columns exist.
    pub daily_limits: bool,
    /// `origins_last_hour` per-hour origin map column exists.
    pub hourly_origin_map: bool,
    /// A SQL helper implementing the ADD-merge over origin maps exists.
    pub add_merge_function: bool,
}

impl StoreCapabilities {
    /// Everything present; what a fully migrated schema reports.
    pub fn full() -> Self {
        Self {
            sliding_window: true,
            daily_limits: true,
            hourly_origin_map: true,
            add_merge_function: true,
        }
    }
}
