//! Per-IP counter upserts.
//!
//! Each aggregation cycle lands as one atomic upsert per IP: inserts seed
//! every window with the cycle's count and carry the *cached* reset
//! stamps (not "now"), conflicts add counts and merge origin maps. A
//! failing row is logged and skipped; only connection-level failures
//! abort the batch so the aggregator can merge its data back.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tracing::warn;

use palisade_store::{StoreCapabilities, StoreError};
use palisade_types::usage::filter_public_origins;
use palisade_types::IpUsage;
use palisade_utils::time;

use crate::error::{is_batch_fatal, PostgresError};
use crate::{counts_to_json, resets, PostgresCounterStore, ResetCache, ADD_MERGE_FN, IP_TABLE};

pub(crate) async fn apply_usage(
    store: &PostgresCounterStore,
    usage: &HashMap<String, IpUsage>,
) -> Result<(), StoreError> {
    let caps = store.caps().await?;
    let conn = store.conn().await?;
    let now = time::unix_now() as i64;

    // Boundary rolls come first so this batch lands in the new window.
    let cache = resets::run_resets(store, &conn, caps, now).await?;

    if !caps.add_merge_function && !store.lww_warned.swap(true, Ordering::SeqCst) {
        warn!(
            "SQL helper '{}' not found; origin maps will merge last-write-wins \
             and per-origin counts may undercount",
            ADD_MERGE_FN
        );
    }

    let upsert_sql = upsert_statement(caps);
    let daily_sql = daily_statement(caps);

    for (ip, ip_usage) in usage {
        // LocalLike origins never reach the persisted per-IP maps. The
        // filter only touches this IP's map; the count itself survives.
        let public_origins = filter_public_origins(&ip_usage.origins);
        if let Err(err) = upsert_ip(
            &conn,
            &upsert_sql,
            daily_sql.as_deref(),
            caps,
            &cache,
            ip,
            ip_usage.count,
            &public_origins,
            now,
        )
        .await
        {
            if is_batch_fatal(&err) {
                return Err(PostgresError::Postgres(err).into());
            }
            warn!(ip = %ip, %err, "counter upsert failed; continuing batch");
        }
    }
    Ok(())
}

/// The ADD-merge update expression for one jsonb column, degrading to the
/// `||` concat operator (per-key last write wins) without the helper.
fn merge_expr(caps: StoreCapabilities, column: &str) -> String {
    if caps.add_merge_function {
        format!("{column} = {ADD_MERGE_FN}({IP_TABLE}.{column}, EXCLUDED.{column})")
    } else {
        format!("{column} = {IP_TABLE}.{column} || EXCLUDED.{column}")
    }
}

/// Build the per-IP upsert for the detected schema. Parameter layout:
/// `$1` ip, `$2` count, `$3` origin map, `$4` hour reset, `$5` now,
/// plus `$6` day reset and `$7` month reset when the daily family exists.
fn upsert_statement(caps: StoreCapabilities) -> String {
    let mut columns = vec![
        "ip",
        "requests_total",
        "requests_last_hour",
        "origins",
        "last_reset_timestamp",
        "updated_at",
    ];
    let mut values = vec!["$1", "$2", "$2", "$3", "$4", "$5"];
    let mut updates = vec![
        format!("requests_total = {IP_TABLE}.requests_total + EXCLUDED.requests_total"),
        format!(
            "requests_last_hour = {IP_TABLE}.requests_last_hour + EXCLUDED.requests_last_hour"
        ),
        merge_expr(caps, "origins"),
        "updated_at = EXCLUDED.updated_at".to_string(),
    ];

    if caps.sliding_window {
        columns.push("requests_previous_hour");
        values.push("0");
        if caps.hourly_origin_map {
            columns.push("origins_previous_hour");
            values.push("'{}'::jsonb");
        }
    }
    if caps.hourly_origin_map {
        columns.push("origins_last_hour");
        values.push("$3");
        updates.push(merge_expr(caps, "origins_last_hour"));
    }
    if caps.daily_limits {
        columns.extend([
            "requests_today",
            "origins_today",
            "requests_this_month",
            "last_day_reset_timestamp",
            "last_month_reset_timestamp",
        ]);
        values.extend(["0", "'{}'::jsonb", "$2", "$6", "$7"]);
        updates.push(format!(
            "requests_this_month = {IP_TABLE}.requests_this_month + EXCLUDED.requests_this_month"
        ));
    }

    format!(
        "INSERT INTO {IP_TABLE} ({}) VALUES ({}) ON CONFLICT (ip) DO UPDATE SET {}",
        columns.join(", "),
        values.join(", "),
        updates.join(", "),
    )
}

/// The daily column family is younger than the main upsert; it is
/// maintained with a follow-up update so the main statement stays valid
/// on schemas that predate it. Parameters: `$1` ip, `$2` count, `$3`
/// origin map.
fn daily_statement(caps: StoreCapabilities) -> Option<String> {
    if !caps.daily_limits {
        return None;
    }
    let merge = if caps.add_merge_function {
        format!("origins_today = {ADD_MERGE_FN}(origins_today, $3)")
    } else {
        "origins_today = origins_today || $3".to_string()
    };
    Some(format!(
        "UPDATE {IP_TABLE} SET requests_today = requests_today + $2, {merge} WHERE ip = $1"
    ))
}

#[allow(clippy::too_many_arguments)]
async fn upsert_ip(
    conn: &Client,
    upsert_sql: &str,
    daily_sql: Option<&str>,
    caps: StoreCapabilities,
    cache: &ResetCache,
    ip: &str,
    count: u64,
    public_origins: &HashMap<String, u64>,
    now: i64,
) -> Result<(), tokio_postgres::Error> {
    let n = count as i64;
    let origins_json = counts_to_json(public_origins);
    let hour_reset = cache.hour.unwrap_or(0);
    let day_reset = cache.day.unwrap_or(0);
    let month_reset = cache.month.unwrap_or(0);

    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&ip, &n, &origins_json, &hour_reset, &now];
    if caps.daily_limits {
        params.extend([&day_reset as &(dyn ToSql + Sync), &month_reset]);
    }
    conn.execute(upsert_sql, &params).await?;

    if let Some(daily_sql) = daily_sql {
        conn.execute(daily_sql, &[&ip, &n, &origins_json]).await?;
    }
    Ok(())
}
