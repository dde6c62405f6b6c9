//! In-memory counter store for tests.
//!
//! Implements the same reset/upsert protocol as the Postgres backend over
//! plain maps, with a settable clock so tests can cross hour, day, and
//! month boundaries deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use palisade_types::usage::filter_public_origins;
use palisade_types::{CounterRow, HistoryRow, IpUsage};
use palisade_utils::time;

use crate::{CounterStore, DailyCount, StoreCapabilities, StoreError, WindowCount};

#[derive(Default)]
struct Inner {
    rows: HashMap<String, CounterRow>,
    history: Vec<HistoryRow>,
    /// Cached global reset boundaries; `None` until first derived.
    last_hour_reset: Option<u64>,
    last_day_reset: Option<u64>,
    last_month_reset: Option<u64>,
    last_history_cleanup: u64,
    apply_calls: u64,
}

/// Test double for [`CounterStore`] backed by in-process maps.
pub struct MemoryCounterStore {
    inner: Mutex<Inner>,
    capabilities: StoreCapabilities,
    /// When non-zero, overrides the wall clock.
    now_override: AtomicU64,
    /// When set, `apply_usage` fails wholesale (for merge-back tests).
    fail_applies: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::full())
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capabilities,
            now_override: AtomicU64::new(0),
            fail_applies: AtomicU64::new(0),
        }
    }

    /// Pin the store's clock to a fixed epoch-seconds value.
    pub fn set_now(&self, now: u64) {
        self.now_override.store(now, Ordering::SeqCst);
    }

    /// Make the next `n` `apply_usage` calls fail at the batch level.
    pub fn fail_next_applies(&self, n: u64) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    /// How many times `apply_usage` has been invoked.
    pub fn apply_calls(&self) -> u64 {
        self.inner.lock().map(|i| i.apply_calls).unwrap_or(0)
    }

    fn now(&self) -> u64 {
        match self.now_override.load(Ordering::SeqCst) {
            0 => time::unix_now(),
            pinned => pinned,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".into()))
    }

    /// Roll month, day, and hour boundaries, in that order, exactly as the
    /// Postgres backend does before any upsert.
    fn run_resets(&self, inner: &mut Inner, now: u64) {
        let month_now = time::month_start(now);
        let day_now = time::day_start(now);
        let hour_now = time::hour_start(now);

        // Derive unknown caches from existing rows, or initialize to the
        // current boundaries on an empty table.
        if inner.last_hour_reset.is_none() {
            inner.last_hour_reset = Some(
                inner
                    .rows
                    .values()
                    .map(|r| r.last_reset_timestamp as u64)
                    .min()
                    .unwrap_or(hour_now),
            );
        }
        if inner.last_day_reset.is_none() {
            inner.last_day_reset = Some(
                inner
                    .rows
                    .values()
                    .map(|r| r.last_day_reset_timestamp as u64)
                    .min()
                    .unwrap_or(day_now),
            );
        }
        if inner.last_month_reset.is_none() {
            inner.last_month_reset = Some(
                inner
                    .rows
                    .values()
                    .map(|r| r.last_month_reset_timestamp as u64)
                    .min()
                    .unwrap_or(month_now),
            );
        }

        if self.capabilities.daily_limits {
            if month_now > inner.last_month_reset.unwrap_or(month_now) {
                for row in inner.rows.values_mut() {
                    row.requests_this_month = 0;
                    row.last_month_reset_timestamp = month_now as i64;
                }
                inner.last_month_reset = Some(month_now);
            }
            if day_now > inner.last_day_reset.unwrap_or(day_now) {
                for row in inner.rows.values_mut() {
                    row.requests_today = 0;
                    row.origins_today.clear();
                    row.last_day_reset_timestamp = day_now as i64;
                }
                inner.last_day_reset = Some(day_now);
            }
        }

        let last_hour = inner.last_hour_reset.unwrap_or(hour_now);
        if hour_now > last_hour {
            // Snapshot the closed hour before touching any counters.
            for row in inner.rows.values() {
                if row.requests_last_hour > 0 {
                    let duplicate = inner
                        .history
                        .iter()
                        .any(|h| h.hour_timestamp == last_hour as i64 && h.ip == row.ip);
                    if !duplicate {
                        inner.history.push(HistoryRow {
                            hour_timestamp: last_hour as i64,
                            ip: row.ip.clone(),
                            request_count: row.requests_last_hour,
                            origins: row.origins_last_hour.clone(),
                        });
                    }
                }
            }

            let gap = hour_now - last_hour > time::SECS_PER_HOUR;
            for row in inner.rows.values_mut() {
                if gap {
                    // Idle for more than one hour: the previous window is
                    // stale too.
                    row.requests_previous_hour = 0;
                    row.origins_previous_hour.clear();
                } else if self.capabilities.sliding_window {
                    row.requests_previous_hour = row.requests_last_hour;
                    row.origins_previous_hour = row.origins_last_hour.clone();
                }
                row.requests_last_hour = 0;
                row.origins_last_hour.clear();
                row.last_reset_timestamp = hour_now as i64;
            }
            inner.last_hour_reset = Some(hour_now);

            if now.saturating_sub(inner.last_history_cleanup) >= time::SECS_PER_DAY {
                let cutoff = now.saturating_sub(30 * time::SECS_PER_DAY) as i64;
                inner.history.retain(|h| h.hour_timestamp >= cutoff);
                inner.last_history_cleanup = now;
            }
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_i64(dst: &mut HashMap<String, i64>, src: &HashMap<String, u64>, add: bool) {
    for (key, n) in src {
        if add {
            *dst.entry(key.clone()).or_insert(0) += *n as i64;
        } else {
            dst.insert(key.clone(), *n as i64);
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn capabilities(&self) -> Result<StoreCapabilities, StoreError> {
        Ok(self.capabilities)
    }

    async fn apply_usage(&self, usage: &HashMap<String, IpUsage>) -> Result<(), StoreError> {
        if self.fail_applies.load(Ordering::SeqCst) > 0 {
            self.fail_applies.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Connection("injected failure".into()));
        }

        let now = self.now();
        let mut inner = self.lock()?;
        inner.apply_calls += 1;
        self.run_resets(&mut inner, now);

        let hour_reset = inner.last_hour_reset.unwrap_or(time::hour_start(now)) as i64;
        let day_reset = inner.last_day_reset.unwrap_or(time::day_start(now)) as i64;
        let month_reset = inner.last_month_reset.unwrap_or(time::month_start(now)) as i64;
        let add = self.capabilities.add_merge_function;
        let daily = self.capabilities.daily_limits;
        let hourly_map = self.capabilities.hourly_origin_map;

        for (ip, ip_usage) in usage {
            let public_origins = filter_public_origins(&ip_usage.origins);
            let n = ip_usage.count as i64;
            let row = inner.rows.entry(ip.clone()).or_insert_with(|| CounterRow {
                ip: ip.clone(),
                last_reset_timestamp: hour_reset,
                last_day_reset_timestamp: day_reset,
                last_month_reset_timestamp: month_reset,
                ..Default::default()
            });
            row.requests_total += n;
            row.requests_last_hour += n;
            if daily {
                row.requests_this_month += n;
                row.requests_today += n;
                merge_i64(&mut row.origins_today, &public_origins, add);
            }
            merge_i64(&mut row.origins, &public_origins, add);
            if hourly_map {
                merge_i64(&mut row.origins_last_hour, &public_origins, add);
            }
            row.updated_at = now as i64;
        }
        Ok(())
    }

    async fn origin_hourly_counts(
        &self,
        weight: f64,
        cap: i64,
    ) -> Result<Vec<WindowCount>, StoreError> {
        let inner = self.lock()?;
        let mut current: HashMap<String, i64> = HashMap::new();
        let mut previous: HashMap<String, i64> = HashMap::new();
        for row in inner.rows.values() {
            for (origin, n) in &row.origins_last_hour {
                *current.entry(origin.clone()).or_insert(0) += n;
            }
            for (origin, n) in &row.origins_previous_hour {
                *previous.entry(origin.clone()).or_insert(0) += n;
            }
        }
        let mut keys: Vec<String> = current.keys().chain(previous.keys()).cloned().collect();
        keys.sort();
        keys.dedup();
        let mut out: Vec<WindowCount> = keys
            .into_iter()
            .map(|key| {
                let cur = current.get(&key).copied().unwrap_or(0);
                let prev = previous.get(&key).copied().unwrap_or(0);
                WindowCount {
                    effective: cur as f64 + prev as f64 * weight,
                    key,
                    current: cur,
                    previous: prev,
                }
            })
            .collect();
        out.sort_by(|a, b| b.effective.total_cmp(&a.effective));
        out.truncate(cap.max(0) as usize);
        Ok(out)
    }

    async fn ip_hourly_counts(
        &self,
        weight: f64,
        cap: i64,
    ) -> Result<Vec<WindowCount>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<WindowCount> = inner
            .rows
            .values()
            .map(|row| WindowCount {
                key: row.ip.clone(),
                current: row.requests_last_hour,
                previous: row.requests_previous_hour,
                effective: row.requests_last_hour as f64
                    + row.requests_previous_hour as f64 * weight,
            })
            .collect();
        out.sort_by(|a, b| b.effective.total_cmp(&a.effective));
        out.truncate(cap.max(0) as usize);
        Ok(out)
    }

    async fn origin_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError> {
        if !self.capabilities.daily_limits {
            return Ok(Vec::new());
        }
        let inner = self.lock()?;
        let mut sums: HashMap<String, i64> = HashMap::new();
        for row in inner.rows.values() {
            for (origin, n) in &row.origins_today {
                *sums.entry(origin.clone()).or_insert(0) += n;
            }
        }
        let mut out: Vec<DailyCount> = sums
            .into_iter()
            .map(|(key, count)| DailyCount { key, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
        out.truncate(cap.max(0) as usize);
        Ok(out)
    }

    async fn ip_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError> {
        if !self.capabilities.daily_limits {
            return Ok(Vec::new());
        }
        let inner = self.lock()?;
        let mut out: Vec<DailyCount> = inner
            .rows
            .values()
            .map(|row| DailyCount {
                key: row.ip.clone(),
                count: row.requests_today,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
        out.truncate(cap.max(0) as usize);
        Ok(out)
    }

    async fn counter_row(&self, ip: &str) -> Result<Option<CounterRow>, StoreError> {
        Ok(self.lock()?.rows.get(ip).cloned())
    }

    async fn history_for_ip(&self, ip: &str) -> Result<Vec<HistoryRow>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<HistoryRow> = inner
            .history
            .iter()
            .filter(|h| h.ip == ip)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.hour_timestamp.cmp(&a.hour_timestamp));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(ip: &str, count: u64, origins: &[(&str, u64)]) -> HashMap<String, IpUsage> {
        let mut map = HashMap::new();
        map.insert(
            ip.to_string(),
            IpUsage {
                count,
                origins: origins.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            },
        );
        map
    }

    // 2024-03-15 14:10:00 UTC
    const T0: u64 = 1_710_511_800;

    #[tokio::test]
    async fn upsert_creates_and_accumulates() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 3, &[("example.com", 3)]))
            .await
            .unwrap();
        store
            .apply_usage(&usage("1.2.3.4", 2, &[("example.com", 1)]))
            .await
            .unwrap();

        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_total, 5);
        assert_eq!(row.requests_last_hour, 5);
        assert_eq!(row.requests_today, 5);
        assert_eq!(row.requests_this_month, 5);
        assert_eq!(row.origins.get("example.com"), Some(&4));
    }

    #[tokio::test]
    async fn local_like_origins_dropped_before_upsert() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage(
                "1.2.3.4",
                4,
                &[("example.com", 2), ("localhost:3000", 2)],
            ))
            .await
            .unwrap();
        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_total, 4);
        assert_eq!(row.origins.len(), 1);
        assert!(row.origins.contains_key("example.com"));
    }

    #[tokio::test]
    async fn hourly_reset_snapshots_then_shifts() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 120, &[("a.test", 120)]))
            .await
            .unwrap();

        // Cross into 15:00.
        store.set_now(T0 + 3_600);
        store.apply_usage(&HashMap::new()).await.unwrap();

        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_last_hour, 0);
        assert_eq!(row.requests_previous_hour, 120);
        assert_eq!(row.origins_previous_hour.get("a.test"), Some(&120));
        assert!(row.origins_last_hour.is_empty());
        assert_eq!(row.last_reset_timestamp as u64, time::hour_start(T0 + 3_600));

        let history = store.history_for_ip("1.2.3.4").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].hour_timestamp as u64, time::hour_start(T0));
        assert_eq!(history[0].request_count, 120);
        assert_eq!(history[0].origins.get("a.test"), Some(&120));
    }

    #[tokio::test]
    async fn multi_hour_gap_clears_both_windows() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 10, &[("a.test", 10)]))
            .await
            .unwrap();

        store.set_now(T0 + 3 * 3_600);
        store.apply_usage(&HashMap::new()).await.unwrap();

        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_last_hour, 0);
        assert_eq!(row.requests_previous_hour, 0);
        assert!(row.origins_previous_hour.is_empty());
    }

    #[tokio::test]
    async fn daily_reset_zeroes_today() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 10, &[("a.test", 10)]))
            .await
            .unwrap();

        store.set_now(T0 + time::SECS_PER_DAY);
        store.apply_usage(&HashMap::new()).await.unwrap();

        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_today, 0);
        assert!(row.origins_today.is_empty());
        assert_eq!(row.requests_total, 10);
    }

    #[tokio::test]
    async fn snapshot_unique_per_hour_and_ip() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 5, &[("a.test", 5)]))
            .await
            .unwrap();
        store.set_now(T0 + 3_600);
        store.apply_usage(&HashMap::new()).await.unwrap();
        store.apply_usage(&HashMap::new()).await.unwrap();

        let history = store.history_for_ip("1.2.3.4").await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn origin_hourly_counts_weighted_and_sorted() {
        let store = MemoryCounterStore::new();
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 8, &[("a.test", 8)]))
            .await
            .unwrap();
        store
            .apply_usage(&usage("5.6.7.8", 3, &[("b.test", 3)]))
            .await
            .unwrap();

        let counts = store.origin_hourly_counts(0.5, 10_000).await.unwrap();
        assert_eq!(counts[0].key, "a.test");
        assert_eq!(counts[0].current, 8);
        assert!((counts[0].effective - 8.0).abs() < f64::EPSILON);
        assert_eq!(counts[1].key, "b.test");
    }

    #[tokio::test]
    async fn degraded_schema_skips_daily_tracking() {
        let caps = StoreCapabilities {
            sliding_window: true,
            daily_limits: false,
            hourly_origin_map: true,
            add_merge_function: true,
        };
        let store = MemoryCounterStore::with_capabilities(caps);
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 5, &[("a.test", 5)]))
            .await
            .unwrap();
        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(row.requests_today, 0);
        assert!(store.origin_daily_counts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lww_merge_overwrites_origin_counts() {
        let caps = StoreCapabilities {
            add_merge_function: false,
            ..StoreCapabilities::full()
        };
        let store = MemoryCounterStore::with_capabilities(caps);
        store.set_now(T0);
        store
            .apply_usage(&usage("1.2.3.4", 3, &[("example.com", 3)]))
            .await
            .unwrap();
        store
            .apply_usage(&usage("1.2.3.4", 1, &[("example.com", 1)]))
            .await
            .unwrap();
        let row = store.counter_row("1.2.3.4").await.unwrap().unwrap();
        // Counters still add; only the map merge degrades.
        assert_eq!(row.requests_total, 4);
        assert_eq!(row.origins.get("example.com"), Some(&1));
    }
}
