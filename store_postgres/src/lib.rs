//! Postgres implementation of the palisade counter store.
//!
//! One table of per-IP counters (`ip_table`), one append-only hourly
//! history table (`ip_history_table`), and an optional SQL helper
//! (`jsonb_add_merge`) providing the ADD-merge over origin maps. Schema
//! capabilities are detected once at startup and every query variant is
//! chosen against them, so partially migrated schemas degrade instead of
//! erroring. Schema creation itself is operator tooling and lives
//! outside this crate.

pub mod capabilities;
pub mod counters;
pub mod error;
pub mod queries;
pub mod resets;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;
use tracing::info;

use palisade_store::{
    CounterStore, DailyCount, StoreCapabilities, StoreError, WindowCount,
};
use palisade_types::{CounterRow, HistoryRow, IpUsage};

use error::PostgresError;

/// Per-IP counter table.
pub(crate) const IP_TABLE: &str = "ip_table";
/// Hourly snapshot table.
pub(crate) const HISTORY_TABLE: &str = "ip_history_table";
/// Name of the optional ADD-merge SQL helper.
pub(crate) const ADD_MERGE_FN: &str = "jsonb_add_merge";

pub(crate) type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Cached global reset boundaries, epoch seconds. `None` until first
/// derived from the table (or initialized on an empty one).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ResetCache {
    pub hour: Option<i64>,
    pub day: Option<i64>,
    pub month: Option<i64>,
    /// Last time the 30-day history sweep ran.
    pub last_history_cleanup: i64,
}

pub struct PostgresCounterStore {
    pool: PgPool,
    capabilities: tokio::sync::OnceCell<StoreCapabilities>,
    resets: tokio::sync::Mutex<ResetCache>,
    /// Set once the last-write-wins degradation has been logged.
    lww_warned: AtomicBool,
}

impl PostgresCounterStore {
    /// Connect a bounded pool to `database_url`.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(pool_size, "connected to counter store");
        Ok(Self {
            pool,
            capabilities: tokio::sync::OnceCell::new(),
            resets: tokio::sync::Mutex::new(ResetCache::default()),
            lww_warned: AtomicBool::new(false),
        })
    }

    pub(crate) async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, PostgresConnectionManager<NoTls>>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::from(PostgresError::Pool(e)))
    }

    pub(crate) async fn caps(&self) -> Result<StoreCapabilities, StoreError> {
        self.capabilities
            .get_or_try_init(|| capabilities::detect(self))
            .await
            .copied()
    }
}

/// JSONB origin map → typed counts. Non-numeric values are dropped.
pub(crate) fn json_to_counts(value: &serde_json::Value) -> HashMap<String, i64> {
    match value.as_object() {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
            .collect(),
        None => HashMap::new(),
    }
}

/// Typed counts → JSONB origin map.
pub(crate) fn counts_to_json(map: &HashMap<String, u64>) -> serde_json::Value {
    serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(*v)))
            .collect(),
    )
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn capabilities(&self) -> Result<StoreCapabilities, StoreError> {
        self.caps().await
    }

    async fn apply_usage(&self, usage: &HashMap<String, IpUsage>) -> Result<(), StoreError> {
        counters::apply_usage(self, usage).await
    }

    async fn origin_hourly_counts(
        &self,
        weight: f64,
        cap: i64,
    ) -> Result<Vec<WindowCount>, StoreError> {
        queries::origin_hourly_counts(self, weight, cap).await
    }

    async fn ip_hourly_counts(
        &self,
        weight: f64,
        cap: i64,
    ) -> Result<Vec<WindowCount>, StoreError> {
        queries::ip_hourly_counts(self, weight, cap).await
    }

    async fn origin_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError> {
        queries::origin_daily_counts(self, cap).await
    }

    async fn ip_daily_counts(&self, cap: i64) -> Result<Vec<DailyCount>, StoreError> {
        queries::ip_daily_counts(self, cap).await
    }

    async fn counter_row(&self, ip: &str) -> Result<Option<CounterRow>, StoreError> {
        queries::counter_row(self, ip).await
    }

    async fn history_for_ip(&self, ip: &str) -> Result<Vec<HistoryRow>, StoreError> {
        queries::history_for_ip(self, ip).await
    }
}
