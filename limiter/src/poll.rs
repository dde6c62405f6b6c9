//! The limiter's store-polling loop.
//!
//! Single-flight: a tick that arrives while a refresh is still running is
//! skipped, not queued. A failed refresh keeps the previous snapshot in
//! place — known offenders stay blocked, newcomers are admitted — and
//! failures are only escalated in the logs once they become consecutive.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use palisade_store::{CounterStore, StoreError};
use palisade_utils::time;

use crate::snapshot::{LimiterSnapshot, WindowDiag};
use crate::RateLimiter;

/// Row cap for every limiter query.
const QUERY_ROW_CAP: i64 = 10_000;
/// Consecutive failures before the retention warning escalates.
const FAILURE_ESCALATION: u32 = 3;

/// Drives [`RateLimiter`] refreshes until shutdown.
pub struct LimiterPoller {
    limiter: Arc<RateLimiter>,
    store: Arc<dyn CounterStore>,
    in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl LimiterPoller {
    pub fn new(limiter: Arc<RateLimiter>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            limiter,
            store,
            in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Poll loop entry point. Ticks every `poll_interval_secs`.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.limiter.config().poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    info!("rate limiter poller stopping");
                    return;
                }
            }
        }
    }

    /// One tick: refresh unless a refresh is already running.
    pub async fn tick(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("limiter poll still running, skipping tick");
            return;
        }
        let result = self.refresh().await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(snapshot) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                debug!(
                    blocked = snapshot.blocked_total(),
                    weight = snapshot.previous_hour_weight,
                    "limiter snapshot refreshed"
                );
                self.limiter.install(snapshot);
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= FAILURE_ESCALATION {
                    warn!(
                        %err,
                        failures,
                        "limiter poll failing repeatedly; retaining previous blocklists"
                    );
                } else {
                    warn!(%err, failures, "limiter poll failed");
                }
            }
        }
    }

    /// Build a fresh snapshot from the store.
    async fn refresh(&self) -> Result<LimiterSnapshot, StoreError> {
        let config = *self.limiter.config();
        let capabilities = self.store.capabilities().await?;
        let now = time::unix_now();
        // Without sliding-window columns the previous hour cannot
        // contribute: degrade to a fixed hourly window.
        let weight = if capabilities.sliding_window {
            time::previous_hour_weight(now)
        } else {
            0.0
        };

        let origin_hourly = if capabilities.hourly_origin_map {
            self.store.origin_hourly_counts(weight, QUERY_ROW_CAP).await?
        } else {
            Vec::new()
        };
        let ip_hourly = self.store.ip_hourly_counts(weight, QUERY_ROW_CAP).await?;
        let (origin_daily, ip_daily) = if capabilities.daily_limits {
            (
                self.store.origin_daily_counts(QUERY_ROW_CAP).await?,
                self.store.ip_daily_counts(QUERY_ROW_CAP).await?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let mut snapshot = LimiterSnapshot {
            previous_hour_weight: weight,
            refreshed_at: now,
            capabilities,
            ..LimiterSnapshot::default()
        };

        for row in origin_hourly {
            if over_limit(row.effective, config.origin_hourly_limit) {
                snapshot.blocked_origins_hourly.insert(row.key.clone());
            }
            snapshot.origin_counts.insert(
                row.key,
                WindowDiag {
                    current: row.current,
                    previous: row.previous,
                    effective: row.effective,
                },
            );
        }
        for row in ip_hourly {
            if over_limit(row.effective, config.ip_hourly_limit) {
                snapshot.blocked_ips_hourly.insert(row.key.clone());
            }
            snapshot.ip_counts.insert(
                row.key,
                WindowDiag {
                    current: row.current,
                    previous: row.previous,
                    effective: row.effective,
                },
            );
        }
        for row in origin_daily {
            if over_limit(row.count as f64, config.origin_daily_limit) {
                snapshot.blocked_origins_daily.insert(row.key.clone());
            }
            snapshot.origin_daily_counts.insert(row.key, row.count);
        }
        for row in ip_daily {
            if over_limit(row.count as f64, config.ip_daily_limit) {
                snapshot.blocked_ips_daily.insert(row.key.clone());
            }
            snapshot.ip_daily_counts.insert(row.key, row.count);
        }

        Ok(snapshot)
    }
}

/// Blocked iff the count strictly exceeds a non-zero limit.
fn over_limit(count: f64, limit: u64) -> bool {
    limit > 0 && count > limit as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use palisade_store::MemoryCounterStore;
    use palisade_types::IpUsage;

    use crate::RateLimitConfig;

    // 2024-03-15 14:30:00 UTC — minute 30, weight 0.5.
    const T_HALF: u64 = 1_710_513_000;

    fn usage(ip: &str, count: u64, origins: &[(&str, u64)]) -> StdHashMap<String, IpUsage> {
        let mut map = StdHashMap::new();
        map.insert(
            ip.to_string(),
            IpUsage {
                count,
                origins: origins.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            },
        );
        map
    }

    fn poller(limits: RateLimitConfig, store: Arc<MemoryCounterStore>) -> Arc<LimiterPoller> {
        let limiter = Arc::new(RateLimiter::new(limits));
        Arc::new(LimiterPoller::new(limiter, store))
    }

    #[tokio::test]
    async fn strict_exceed_blocks_origin() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_now(T_HALF);
        // 11 current-hour requests against a limit of 10.
        store
            .apply_usage(&usage("1.2.3.4", 11, &[("a.test", 11)]))
            .await
            .unwrap();

        let poller = poller(
            RateLimitConfig {
                origin_hourly_limit: 10,
                ..RateLimitConfig::default()
            },
            store,
        );
        poller.tick().await;

        let snapshot = poller.limiter.snapshot();
        assert!(snapshot.blocked_origins_hourly.contains("a.test"));
        assert!(poller.limiter.check("9.9.9.9", "https://a.test").is_some());
    }

    #[tokio::test]
    async fn exactly_at_limit_is_allowed() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_now(T_HALF);
        store
            .apply_usage(&usage("1.2.3.4", 10, &[("a.test", 10)]))
            .await
            .unwrap();

        let poller = poller(
            RateLimitConfig {
                origin_hourly_limit: 10,
                ..RateLimitConfig::default()
            },
            store,
        );
        poller.tick().await;

        assert!(poller.limiter.check("9.9.9.9", "https://a.test").is_none());
    }

    #[tokio::test]
    async fn sliding_window_counts_previous_hour() {
        let store = Arc::new(MemoryCounterStore::new());
        // Hour H: 10 requests from a.test.
        store.set_now(T_HALF - 1800);
        store
            .apply_usage(&usage("1.2.3.4", 10, &[("a.test", 10)]))
            .await
            .unwrap();
        // Cross into hour H+1, then 8 more at minute 30.
        store.set_now(T_HALF + 1800 + 1800);
        store
            .apply_usage(&usage("1.2.3.4", 8, &[("a.test", 8)]))
            .await
            .unwrap();

        let poller = poller(
            RateLimitConfig {
                origin_hourly_limit: 10,
                ..RateLimitConfig::default()
            },
            Arc::clone(&store),
        );
        poller.tick().await;

        // The refresh weight comes from the real wall clock, so assert
        // against the snapshot's own weight rather than a fixed 0.5.
        let snapshot = poller.limiter.snapshot();
        let diag = snapshot.origin_counts.get("a.test").unwrap();
        assert_eq!(diag.current, 8);
        assert_eq!(diag.previous, 10);
        let expected = 8.0 + 10.0 * snapshot.previous_hour_weight;
        assert!((diag.effective - expected).abs() < 1.0);
    }

    #[tokio::test]
    async fn daily_cap_blocks_ip() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_now(T_HALF);
        store.apply_usage(&usage("1.2.3.4", 101, &[])).await.unwrap();

        let poller = poller(
            RateLimitConfig {
                ip_daily_limit: 100,
                ..RateLimitConfig::default()
            },
            store,
        );
        poller.tick().await;

        let denial = poller.limiter.check("1.2.3.4", "unknown").unwrap();
        assert!(denial.reason.contains("daily"));
    }

    /// Delegates to a memory store until told to fail its reads.
    struct FlakyStore {
        inner: MemoryCounterStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), palisade_store::StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(palisade_store::StoreError::Connection(
                    "store unreachable".into(),
                ))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl CounterStore for FlakyStore {
        async fn capabilities(
            &self,
        ) -> Result<palisade_store::StoreCapabilities, palisade_store::StoreError> {
            self.check()?;
            self.inner.capabilities().await
        }

        async fn apply_usage(
            &self,
            usage: &StdHashMap<String, palisade_types::IpUsage>,
        ) -> Result<(), palisade_store::StoreError> {
            self.check()?;
            self.inner.apply_usage(usage).await
        }

        async fn origin_hourly_counts(
            &self,
            weight: f64,
            cap: i64,
        ) -> Result<Vec<palisade_store::WindowCount>, palisade_store::StoreError> {
            self.check()?;
            self.inner.origin_hourly_counts(weight, cap).await
        }

        async fn ip_hourly_counts(
            &self,
            weight: f64,
            cap: i64,
        ) -> Result<Vec<palisade_store::WindowCount>, palisade_store::StoreError> {
            self.check()?;
            self.inner.ip_hourly_counts(weight, cap).await
        }

        async fn origin_daily_counts(
            &self,
            cap: i64,
        ) -> Result<Vec<palisade_store::DailyCount>, palisade_store::StoreError> {
            self.check()?;
            self.inner.origin_daily_counts(cap).await
        }

        async fn ip_daily_counts(
            &self,
            cap: i64,
        ) -> Result<Vec<palisade_store::DailyCount>, palisade_store::StoreError> {
            self.check()?;
            self.inner.ip_daily_counts(cap).await
        }

        async fn counter_row(
            &self,
            ip: &str,
        ) -> Result<Option<palisade_types::CounterRow>, palisade_store::StoreError> {
            self.inner.counter_row(ip).await
        }

        async fn history_for_ip(
            &self,
            ip: &str,
        ) -> Result<Vec<palisade_types::HistoryRow>, palisade_store::StoreError> {
            self.inner.history_for_ip(ip).await
        }
    }

    #[tokio::test]
    async fn poll_failure_retains_previous_snapshot() {
        let store = Arc::new(FlakyStore {
            inner: MemoryCounterStore::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
        });
        store.inner.set_now(T_HALF);
        store
            .inner
            .apply_usage(&usage("1.2.3.4", 11, &[("a.test", 11)]))
            .await
            .unwrap();

        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            origin_hourly_limit: 10,
            ..RateLimitConfig::default()
        }));
        let poller = Arc::new(LimiterPoller::new(
            Arc::clone(&limiter),
            Arc::clone(&store) as Arc<dyn CounterStore>,
        ));
        poller.tick().await;
        assert!(limiter.check("9.9.9.9", "https://a.test").is_some());
        let refreshed = limiter.snapshot().refreshed_at;

        // Repeated failing polls keep the last good snapshot: known
        // offenders stay blocked.
        store.failing.store(true, Ordering::SeqCst);
        for _ in 0..4 {
            poller.tick().await;
        }
        assert_eq!(limiter.snapshot().refreshed_at, refreshed);
        assert!(limiter.check("9.9.9.9", "https://a.test").is_some());
        assert_eq!(poller.consecutive_failures.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_limit_disables_tier() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_now(T_HALF);
        store
            .apply_usage(&usage("1.2.3.4", 1_000, &[("a.test", 1_000)]))
            .await
            .unwrap();

        let poller = poller(RateLimitConfig::default(), store);
        poller.tick().await;

        assert!(poller.limiter.check("1.2.3.4", "https://a.test").is_none());
        assert!(poller.limiter.check("1.2.3.4", "unknown").is_none());
    }
}
