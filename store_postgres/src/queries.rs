//! Read queries feeding the rate limiter and the admin surface.
//!
//! The limiter queries compute effective sliding-window counts inside
//! Postgres so the row cap and ordering happen server-side; origin-level
//! numbers aggregate the per-row jsonb maps with `jsonb_each_text`.

use tokio_postgres::Row;

use palisade_store::{DailyCount, StoreError, WindowCount};
use palisade_types::{CounterRow, HistoryRow};

use crate::error::PostgresError;
use crate::{json_to_counts, PostgresCounterStore, HISTORY_TABLE, IP_TABLE};

pub(crate) async fn origin_hourly_counts(
    store: &PostgresCounterStore,
    weight: f64,
    cap: i64,
) -> Result<Vec<WindowCount>, StoreError> {
    let caps = store.caps().await?;
    if !caps.hourly_origin_map {
        return Ok(Vec::new());
    }
    let conn = store.conn().await?;

    let sql = if caps.sliding_window {
        format!(
            "WITH cur AS ( \
                 SELECT kv.key AS key, SUM(kv.value::bigint) AS n \
                 FROM {IP_TABLE}, jsonb_each_text(origins_last_hour) AS kv \
                 GROUP BY kv.key \
             ), prev AS ( \
                 SELECT kv.key AS key, SUM(kv.value::bigint) AS n \
                 FROM {IP_TABLE}, jsonb_each_text(origins_previous_hour) AS kv \
                 GROUP BY kv.key \
             ) \
             SELECT COALESCE(cur.key, prev.key) AS key, \
                    COALESCE(cur.n, 0) AS current, \
                    COALESCE(prev.n, 0) AS previous, \
                    COALESCE(cur.n, 0) + COALESCE(prev.n, 0) * $1::float8 AS effective \
             FROM cur FULL OUTER JOIN prev ON cur.key = prev.key \
             ORDER BY effective DESC \
             LIMIT $2"
        )
    } else {
        format!(
            "SELECT kv.key AS key, \
                    SUM(kv.value::bigint) AS current, \
                    0::bigint AS previous, \
                    SUM(kv.value::bigint)::float8 + 0 * $1::float8 AS effective \
             FROM {IP_TABLE}, jsonb_each_text(origins_last_hour) AS kv \
             GROUP BY kv.key \
             ORDER BY effective DESC \
             LIMIT $2"
        )
    };

    let rows = conn
        .query(&sql, &[&weight, &cap])
        .await
        .map_err(PostgresError::Postgres)?;
    Ok(rows.iter().map(window_count_from_row).collect())
}

pub(crate) async fn ip_hourly_counts(
    store: &PostgresCounterStore,
    weight: f64,
    cap: i64,
) -> Result<Vec<WindowCount>, StoreError> {
    let caps = store.caps().await?;
    let conn = store.conn().await?;

    let sql = if caps.sliding_window {
        format!(
            "SELECT ip AS key, \
                    requests_last_hour AS current, \
                    requests_previous_hour AS previous, \
                    requests_last_hour + requests_previous_hour * $1::float8 AS effective \
             FROM {IP_TABLE} \
             ORDER BY effective DESC \
             LIMIT $2"
        )
    } else {
        format!(
            "SELECT ip AS key, \
                    requests_last_hour AS current, \
                    0::bigint AS previous, \
                    requests_last_hour::float8 + 0 * $1::float8 AS effective \
             FROM {IP_TABLE} \
             ORDER BY effective DESC \
             LIMIT $2"
        )
    };

    let rows = conn
        .query(&sql, &[&weight, &cap])
        .await
        .map_err(PostgresError::Postgres)?;
    Ok(rows.iter().map(window_count_from_row).collect())
}

fn window_count_from_row(row: &Row) -> WindowCount {
    WindowCount {
        key: row.get("key"),
        current: row.get("current"),
        previous: row.get("previous"),
        effective: row.get("effective"),
    }
}

pub(crate) async fn origin_daily_counts(
    store: &PostgresCounterStore,
    cap: i64,
) -> Result<Vec<DailyCount>, StoreError> {
    let caps = store.caps().await?;
    if !caps.daily_limits {
        return Ok(Vec::new());
    }
    let conn = store.conn().await?;
    let rows = conn
        .query(
            &format!(
                "SELECT kv.key AS key, SUM(kv.value::bigint) AS count \
                 FROM {IP_TABLE}, jsonb_each_text(origins_today) AS kv \
                 GROUP BY kv.key \
                 ORDER BY count DESC \
                 LIMIT $1"
            ),
            &[&cap],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    Ok(rows
        .iter()
        .map(|row| DailyCount {
            key: row.get("key"),
            count: row.get("count"),
        })
        .collect())
}

pub(crate) async fn ip_daily_counts(
    store: &PostgresCounterStore,
    cap: i64,
) -> Result<Vec<DailyCount>, StoreError> {
    let caps = store.caps().await?;
    if !caps.daily_limits {
        return Ok(Vec::new());
    }
    let conn = store.conn().await?;
    let rows = conn
        .query(
            &format!(
                "SELECT ip AS key, requests_today AS count \
                 FROM {IP_TABLE} \
                 ORDER BY count DESC \
                 LIMIT $1"
            ),
            &[&cap],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    Ok(rows
        .iter()
        .map(|row| DailyCount {
            key: row.get("key"),
            count: row.get("count"),
        })
        .collect())
}

pub(crate) async fn counter_row(
    store: &PostgresCounterStore,
    ip: &str,
) -> Result<Option<CounterRow>, StoreError> {
    let caps = store.caps().await?;
    let conn = store.conn().await?;

    let mut columns = vec![
        "ip",
        "requests_total",
        "requests_last_hour",
        "origins",
        "last_reset_timestamp",
        "updated_at",
    ];
    if caps.sliding_window {
        columns.push("requests_previous_hour");
        if caps.hourly_origin_map {
            columns.push("origins_previous_hour");
        }
    }
    if caps.hourly_origin_map {
        columns.push("origins_last_hour");
    }
    if caps.daily_limits {
        columns.extend([
            "requests_today",
            "origins_today",
            "requests_this_month",
            "last_day_reset_timestamp",
            "last_month_reset_timestamp",
        ]);
    }

    let sql = format!(
        "SELECT {} FROM {IP_TABLE} WHERE ip = $1",
        columns.join(", ")
    );
    let row = conn
        .query_opt(&sql, &[&ip])
        .await
        .map_err(PostgresError::Postgres)?;

    Ok(row.map(|row| {
        let mut out = CounterRow {
            ip: row.get("ip"),
            requests_total: row.get("requests_total"),
            requests_last_hour: row.get("requests_last_hour"),
            origins: json_to_counts(&row.get("origins")),
            last_reset_timestamp: row.get("last_reset_timestamp"),
            updated_at: row.get("updated_at"),
            ..CounterRow::default()
        };
        if caps.sliding_window {
            out.requests_previous_hour = row.get("requests_previous_hour");
            if caps.hourly_origin_map {
                out.origins_previous_hour = json_to_counts(&row.get("origins_previous_hour"));
            }
        }
        if caps.hourly_origin_map {
            out.origins_last_hour = json_to_counts(&row.get("origins_last_hour"));
        }
        if caps.daily_limits {
            out.requests_today = row.get("requests_today");
            out.origins_today = json_to_counts(&row.get("origins_today"));
            out.requests_this_month = row.get("requests_this_month");
            out.last_day_reset_timestamp = row.get("last_day_reset_timestamp");
            out.last_month_reset_timestamp = row.get("last_month_reset_timestamp");
        }
        out
    }))
}

pub(crate) async fn history_for_ip(
    store: &PostgresCounterStore,
    ip: &str,
) -> Result<Vec<HistoryRow>, StoreError> {
    let conn = store.conn().await?;
    let rows = conn
        .query(
            &format!(
                "SELECT hour_timestamp, ip, request_count, origins \
                 FROM {HISTORY_TABLE} \
                 WHERE ip = $1 \
                 ORDER BY hour_timestamp DESC"
            ),
            &[&ip],
        )
        .await
        .map_err(PostgresError::Postgres)?;
    Ok(rows
        .iter()
        .map(|row| HistoryRow {
            hour_timestamp: row.get("hour_timestamp"),
            ip: row.get("ip"),
            request_count: row.get("request_count"),
            origins: json_to_counts(&row.get("origins")),
        })
        .collect())
}
