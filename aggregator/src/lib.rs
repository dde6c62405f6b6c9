//! Thread-safe request accounting, drained periodically into the store.
//!
//! Request handlers credit the aggregator after every successful
//! primary-mode forward; the flush loop (see [`flush`]) swaps the maps
//! out wholesale and writes them behind the hot path. The maps are the
//! only structure mutated from both request tasks and a background loop,
//! so both live behind a single mutex and no alias to them ever leaves
//! this module.

pub mod flush;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use palisade_types::origin::{self, OriginClass};
use palisade_types::usage::merge_add;
use palisade_types::{ip, IpUsage, OriginCounts};

pub use flush::{run_flush_loop, FlushConfig, NullDemandSink, OriginDemandSink, SettlementHook};

#[derive(Default)]
struct Maps {
    url_counts: OriginCounts,
    ip_counts: HashMap<String, IpUsage>,
}

/// Admin view of the aggregator.
#[derive(Clone, Debug, Serialize)]
pub struct AggregatorSnapshot {
    /// Distinct origins with pending counts.
    pub pending_origins: usize,
    /// Distinct IPs with pending counts.
    pub pending_ips: usize,
    /// Sum of pending per-IP request counts.
    pub pending_requests: u64,
    /// Successful flush cycles since process start.
    pub flush_cycles: u64,
}

/// Per-origin and per-IP request counters for the current flush window.
pub struct UsageAggregator {
    maps: Mutex<Maps>,
    /// Origins that are synthetic monitoring traffic, never billed.
    synthetic_origins: Vec<String>,
    successful_flushes: AtomicU64,
}

impl UsageAggregator {
    pub fn new(synthetic_origins: Vec<String>) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            synthetic_origins: synthetic_origins
                .into_iter()
                .map(|o| origin::clean(&o))
                .collect(),
            successful_flushes: AtomicU64::new(0),
        }
    }

    fn is_synthetic(&self, cleaned: &str) -> bool {
        self.synthetic_origins.iter().any(|s| s == cleaned)
    }

    /// Credit `n` requests from `client_ip` with the given origin header.
    /// Called once per successful primary-mode forward; batches pass
    /// their full length as `n`.
    pub fn credit(&self, client_ip: &str, request_origin: &str, n: u64) {
        if n == 0 {
            return;
        }
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.update_url_counts(&mut maps, request_origin, n);
        self.update_ip_counts(&mut maps, client_ip, request_origin, n);
    }

    /// Origin-demand half: cleaned origin → count. Local and synthetic
    /// origins are not demand.
    fn update_url_counts(&self, maps: &mut Maps, request_origin: &str, n: u64) {
        let cleaned = origin::clean(request_origin);
        if cleaned.is_empty() || cleaned.contains("localhost") || self.is_synthetic(&cleaned) {
            return;
        }
        *maps.url_counts.entry(cleaned).or_insert(0) += n;
    }

    /// Per-IP half: loopback clients and synthetic-origin traffic are
    /// skipped entirely; the per-origin sub-map only records public
    /// origins.
    fn update_ip_counts(&self, maps: &mut Maps, client_ip: &str, request_origin: &str, n: u64) {
        if ip::is_loopback(client_ip) {
            return;
        }
        let cleaned = origin::clean(request_origin);
        if self.is_synthetic(&cleaned) {
            return;
        }
        let usage = maps.ip_counts.entry(client_ip.to_string()).or_default();
        usage.count += n;
        if origin::classify(request_origin) == OriginClass::Public {
            *usage.origins.entry(cleaned).or_insert(0) += n;
        }
    }

    /// Atomically take both maps, leaving empty ones behind. The flush
    /// loop owns the returned values; request threads keep accumulating
    /// into the fresh maps.
    pub fn swap(&self) -> (OriginCounts, HashMap<String, IpUsage>) {
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let taken = std::mem::take(&mut *maps);
        (taken.url_counts, taken.ip_counts)
    }

    /// ADD-merge previously swapped maps back after a failed flush so the
    /// next cycle retries them.
    pub fn merge_back(&self, url_counts: OriginCounts, ip_counts: HashMap<String, IpUsage>) {
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        merge_add(&mut maps.url_counts, &url_counts);
        for (client_ip, usage) in &ip_counts {
            maps.ip_counts
                .entry(client_ip.clone())
                .or_default()
                .merge(usage);
        }
    }

    pub(crate) fn record_successful_flush(&self) -> u64 {
        self.successful_flushes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        let maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        AggregatorSnapshot {
            pending_origins: maps.url_counts.len(),
            pending_ips: maps.ip_counts.len(),
            pending_requests: maps.ip_counts.values().map(|u| u.count).sum(),
            flush_cycles: self.successful_flushes.load(Ordering::SeqCst),
        }
    }
}
