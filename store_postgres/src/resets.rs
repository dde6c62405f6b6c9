//! The global hourly/daily/monthly reset protocol.
//!
//! Runs at the top of every `apply_usage` invocation, before any upsert,
//! so the first write after a boundary lands in the new window. The
//! hourly step snapshots the closed hour into the history table before
//! zeroing anything, then shifts the current window into the previous
//! one — unless more than one hour elapsed, in which case both windows
//! are stale and cleared.

use tokio_postgres::Client;
use tracing::{debug, info};

use palisade_store::{StoreCapabilities, StoreError};
use palisade_utils::time;

use crate::error::PostgresError;
use crate::{PostgresCounterStore, ResetCache, HISTORY_TABLE, IP_TABLE};

/// History rows older than this are swept.
const HISTORY_RETENTION_SECS: i64 = 30 * 86_400;
/// Minimum interval between history sweeps.
const CLEANUP_INTERVAL_SECS: i64 = 86_400;

/// Roll any crossed boundaries and return the reset stamps the following
/// upserts must carry.
pub(crate) async fn run_resets(
    store: &PostgresCounterStore,
    conn: &Client,
    caps: StoreCapabilities,
    now: i64,
) -> Result<ResetCache, StoreError> {
    let hour_now = time::hour_start(now.max(0) as u64) as i64;
    let day_now = time::day_start(now.max(0) as u64) as i64;
    let month_now = time::month_start(now.max(0) as u64) as i64;

    let mut cache = store.resets.lock().await;
    derive_unknown(&mut cache, conn, caps, hour_now, day_now, month_now).await?;

    if caps.daily_limits {
        reset_monthly(&mut cache, conn, month_now).await?;
        reset_daily(&mut cache, conn, day_now).await?;
    }
    reset_hourly(&mut cache, conn, caps, hour_now, now).await?;

    Ok(*cache)
}

/// At process start the caches are unknown: derive them from the oldest
/// stamps in the table, or initialize to the current boundaries when the
/// table is empty.
async fn derive_unknown(
    cache: &mut ResetCache,
    conn: &Client,
    caps: StoreCapabilities,
    hour_now: i64,
    day_now: i64,
    month_now: i64,
) -> Result<(), StoreError> {
    if cache.hour.is_some() {
        return Ok(());
    }

    let row = conn
        .query_one(
            &format!("SELECT MIN(last_reset_timestamp) FROM {IP_TABLE}"),
            &[],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    let min_hour: Option<i64> = row.get(0);
    cache.hour = Some(min_hour.unwrap_or(hour_now));

    if caps.daily_limits {
        let row = conn
            .query_one(
                &format!(
                    "SELECT MIN(last_day_reset_timestamp), MIN(last_month_reset_timestamp) \
                     FROM {IP_TABLE}"
                ),
                &[],
            )
            .await
            .map_err(PostgresError::Postgres)?;
        let min_day: Option<i64> = row.get(0);
        let min_month: Option<i64> = row.get(1);
        cache.day = Some(min_day.unwrap_or(day_now));
        cache.month = Some(min_month.unwrap_or(month_now));
    } else {
        cache.day = Some(day_now);
        cache.month = Some(month_now);
    }

    info!(
        hour = cache.hour,
        day = cache.day,
        month = cache.month,
        "derived reset timestamps"
    );
    Ok(())
}

async fn reset_monthly(
    cache: &mut ResetCache,
    conn: &Client,
    month_now: i64,
) -> Result<(), StoreError> {
    if month_now <= cache.month.unwrap_or(month_now) {
        return Ok(());
    }
    let updated = conn
        .execute(
            &format!(
                "UPDATE {IP_TABLE} \
                 SET requests_this_month = 0, last_month_reset_timestamp = $1"
            ),
            &[&month_now],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    info!(rows = updated, month_start = month_now, "monthly counters reset");
    cache.month = Some(month_now);
    Ok(())
}

async fn reset_daily(
    cache: &mut ResetCache,
    conn: &Client,
    day_now: i64,
) -> Result<(), StoreError> {
    if day_now <= cache.day.unwrap_or(day_now) {
        return Ok(());
    }
    let updated = conn
        .execute(
            &format!(
                "UPDATE {IP_TABLE} \
                 SET requests_today = 0, origins_today = '{{}}'::jsonb, \
                     last_day_reset_timestamp = $1"
            ),
            &[&day_now],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    info!(rows = updated, day_start = day_now, "daily counters reset");
    cache.day = Some(day_now);
    Ok(())
}

async fn reset_hourly(
    cache: &mut ResetCache,
    conn: &Client,
    caps: StoreCapabilities,
    hour_now: i64,
    now: i64,
) -> Result<(), StoreError> {
    let last = cache.hour.unwrap_or(hour_now);
    if hour_now <= last {
        return Ok(());
    }

    // Snapshot before zeroing: one history row per IP that was active in
    // the closed hour, keyed by that hour's start.
    let origins_expr = if caps.hourly_origin_map {
        "origins_last_hour"
    } else {
        "'{}'::jsonb"
    };
    let snapshotted = conn
        .execute(
            &format!(
                "INSERT INTO {HISTORY_TABLE} \
                     (hour_timestamp, ip, request_count, origins, created_at) \
                 SELECT $1, ip, requests_last_hour, {origins_expr}, $2 \
                 FROM {IP_TABLE} WHERE requests_last_hour > 0 \
                 ON CONFLICT (hour_timestamp, ip) DO NOTHING"
            ),
            &[&last, &now],
        )
        .await
        .map_err(PostgresError::Postgres)?;

    // More than one hour since the last reset means the "previous hour"
    // on record is not the hour before this one; both windows are stale.
    let gap = hour_now - last > time::SECS_PER_HOUR as i64;
    let shift_sql = match (gap, caps.sliding_window, caps.hourly_origin_map) {
        (false, true, true) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_previous_hour = requests_last_hour, \
                 origins_previous_hour = origins_last_hour, \
                 requests_last_hour = 0, \
                 origins_last_hour = '{{}}'::jsonb, \
                 last_reset_timestamp = $1"
        ),
        (false, true, false) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_previous_hour = requests_last_hour, \
                 requests_last_hour = 0, \
                 last_reset_timestamp = $1"
        ),
        (true, true, true) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_previous_hour = 0, \
                 origins_previous_hour = '{{}}'::jsonb, \
                 requests_last_hour = 0, \
                 origins_last_hour = '{{}}'::jsonb, \
                 last_reset_timestamp = $1"
        ),
        (true, true, false) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_previous_hour = 0, \
                 requests_last_hour = 0, \
                 last_reset_timestamp = $1"
        ),
        (_, false, true) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_last_hour = 0, \
                 origins_last_hour = '{{}}'::jsonb, \
                 last_reset_timestamp = $1"
        ),
        (_, false, false) => format!(
            "UPDATE {IP_TABLE} SET \
                 requests_last_hour = 0, \
                 last_reset_timestamp = $1"
        ),
    };
    let shifted = conn
        .execute(&shift_sql, &[&hour_now])
        .await
        .map_err(PostgresError::Postgres)?;
    info!(
        rows = shifted,
        snapshotted,
        hour_start = hour_now,
        gap,
        "hourly counters reset"
    );
    cache.hour = Some(hour_now);

    if now - cache.last_history_cleanup >= CLEANUP_INTERVAL_SECS {
        let cutoff = now - HISTORY_RETENTION_SECS;
        let deleted = conn
            .execute(
                &format!("DELETE FROM {HISTORY_TABLE} WHERE hour_timestamp < $1"),
                &[&cutoff],
            )
            .await
            .map_err(PostgresError::Postgres)?;
        debug!(deleted, cutoff, "history table swept");
        cache.last_history_cleanup = now;
    }

    Ok(())
}
