//! Schema capability detection.
//!
//! Runs once per process. The answers decide which statement variants the
//! rest of the crate uses; they are never treated as errors.

use std::collections::HashSet;

use tracing::info;

use palisade_store::{StoreCapabilities, StoreError};

use crate::error::PostgresError;
use crate::{PostgresCounterStore, ADD_MERGE_FN, IP_TABLE};

pub(crate) async fn detect(
    store: &PostgresCounterStore,
) -> Result<StoreCapabilities, StoreError> {
    let conn = store.conn().await?;

    let rows = conn
        .query(
            "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
            &[&IP_TABLE],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    let columns: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();

    let merge_fn = conn
        .query_one(
            "SELECT COUNT(*) FROM pg_proc WHERE proname = $1",
            &[&ADD_MERGE_FN],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    let merge_count: i64 = merge_fn.get(0);

    let capabilities = StoreCapabilities {
        sliding_window: columns.contains("requests_previous_hour"),
        daily_limits: columns.contains("requests_today")
            && columns.contains("last_day_reset_timestamp"),
        hourly_origin_map: columns.contains("origins_last_hour"),
        add_merge_function: merge_count > 0,
    };

    info!(
        sliding_window = capabilities.sliding_window,
        daily_limits = capabilities.daily_limits,
        hourly_origin_map = capabilities.hourly_origin_map,
        add_merge_function = capabilities.add_merge_function,
        "detected store capabilities"
    );
    Ok(capabilities)
}
