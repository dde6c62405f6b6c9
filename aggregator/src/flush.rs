//! The aggregator flush loop.
//!
//! Every tick swaps the live maps out and writes both halves — origin
//! demand to the external updater, per-IP counters to the store —
//! concurrently. A failure of either half merges both back into the live
//! maps so the next cycle retries; counts are never lost to a single bad
//! cycle. The store is invoked even for empty cycles so its reset
//! protocol keeps rolling window boundaries on idle deployments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use palisade_store::CounterStore;
use palisade_types::OriginCounts;

use crate::UsageAggregator;

/// Errors surfaced by external sinks.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Consumer of per-origin demand counts (the billing side).
#[async_trait]
pub trait OriginDemandSink: Send + Sync {
    async fn record_demand(&self, demand: &OriginCounts) -> Result<(), SinkError>;
}

/// Invoked after every tenth successful flush cycle; the settlement
/// component picks up accumulated demand from there.
#[async_trait]
pub trait SettlementHook: Send + Sync {
    async fn settle(&self) -> Result<(), SinkError>;
}

/// Demand sink for deployments without a billing side.
pub struct NullDemandSink;

#[async_trait]
impl OriginDemandSink for NullDemandSink {
    async fn record_demand(&self, _demand: &OriginCounts) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Invoke the settlement hook after this many successful cycles.
const SETTLEMENT_CYCLE: u64 = 10;

#[derive(Clone, Copy, Debug)]
pub struct FlushConfig {
    pub interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// One flush cycle. Returns `true` when both halves landed.
pub async fn flush_once(
    aggregator: &UsageAggregator,
    store: &dyn CounterStore,
    demand: &dyn OriginDemandSink,
    settlement: Option<&dyn SettlementHook>,
) -> bool {
    let (url_counts, ip_counts) = aggregator.swap();
    let had_demand = !url_counts.is_empty();

    let demand_result = async {
        if had_demand {
            demand.record_demand(&url_counts).await
        } else {
            Ok(())
        }
    };
    // Resets must fire even on an empty batch.
    let store_result = store.apply_usage(&ip_counts);
    let (demand_result, store_result) = tokio::join!(demand_result, store_result);

    let demand_failed = demand_result.is_err();
    let store_failed = store_result.is_err();
    if let Err(err) = demand_result {
        warn!(%err, "origin demand update failed");
    }
    if let Err(err) = &store_result {
        warn!(%err, "counter store update failed");
    }

    if demand_failed || store_failed {
        // Restore both halves; the next cycle retries everything.
        aggregator.merge_back(url_counts, ip_counts);
        return false;
    }

    let cycles = aggregator.record_successful_flush();
    debug!(cycles, "aggregator flush complete");
    if cycles % SETTLEMENT_CYCLE == 0 {
        if let Some(hook) = settlement {
            if let Err(err) = hook.settle().await {
                warn!(%err, "settlement hook failed");
            }
        }
    }
    true
}

/// Supervised flush loop; single-flight, ticks every `config.interval`.
pub async fn run_flush_loop(
    aggregator: Arc<UsageAggregator>,
    store: Arc<dyn CounterStore>,
    demand: Arc<dyn OriginDemandSink>,
    settlement: Option<Arc<dyn SettlementHook>>,
    config: FlushConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let in_flight = AtomicBool::new(false);
    let mut ticker = tokio::time::interval(config.interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.swap(true, Ordering::SeqCst) {
                    debug!("previous flush still running, skipping tick");
                    continue;
                }
                flush_once(
                    &aggregator,
                    store.as_ref(),
                    demand.as_ref(),
                    settlement.as_deref(),
                )
                .await;
                in_flight.store(false, Ordering::SeqCst);
            }
            _ = shutdown.recv() => {
                // Final drain so shutdown loses nothing already counted.
                flush_once(
                    &aggregator,
                    store.as_ref(),
                    demand.as_ref(),
                    settlement.as_deref(),
                )
                .await;
                info!("aggregator flush loop stopping");
                return;
            }
        }
    }
}
