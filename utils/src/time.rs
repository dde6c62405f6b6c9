//! UTC window arithmetic for the hourly/daily/monthly counter protocol.
//!
//! All timestamps are epoch seconds. Hour and day boundaries are plain
//! modular arithmetic; month boundaries go through `chrono` because
//! calendar months are irregular.

use chrono::{Datelike, TimeZone, Utc};

pub const SECS_PER_HOUR: u64 = 3_600;
pub const SECS_PER_DAY: u64 = 86_400;

/// Current wall-clock time as epoch seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Start of the clock hour containing `now`.
pub fn hour_start(now: u64) -> u64 {
    now - now % SECS_PER_HOUR
}

/// Start of the UTC day containing `now`.
pub fn day_start(now: u64) -> u64 {
    now - now % SECS_PER_DAY
}

/// First instant of the UTC calendar month containing `now`.
pub fn month_start(now: u64) -> u64 {
    let dt = match Utc.timestamp_opt(now as i64, 0).single() {
        Some(dt) => dt,
        None => return day_start(now),
    };
    match Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0).single() {
        Some(first) => first.timestamp().max(0) as u64,
        None => day_start(now),
    }
}

/// Seconds until the next clock hour begins.
pub fn secs_to_next_hour(now: u64) -> u64 {
    SECS_PER_HOUR - now % SECS_PER_HOUR
}

/// Seconds until the next UTC midnight.
pub fn secs_to_next_midnight(now: u64) -> u64 {
    SECS_PER_DAY - now % SECS_PER_DAY
}

/// Sliding-window weight of the previous hour: `1 − minutes_into_hour/60`.
///
/// Minute granularity, clamped to `[0, 1]`. At minute 0 the previous hour
/// counts fully; at minute 59 it contributes 1/60 of its requests.
pub fn previous_hour_weight(now: u64) -> f64 {
    let minutes_into_hour = (now % SECS_PER_HOUR) / 60;
    1.0 - minutes_into_hour as f64 / 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15 15:30:00 UTC
    const MID_HOUR: u64 = 1_710_516_600;

    #[test]
    fn hour_start_truncates() {
        assert_eq!(hour_start(MID_HOUR), MID_HOUR - 1800);
        assert_eq!(hour_start(MID_HOUR) % 3600, 0);
    }

    #[test]
    fn day_start_truncates() {
        assert_eq!(day_start(MID_HOUR) % 86_400, 0);
        assert!(day_start(MID_HOUR) <= MID_HOUR);
        assert!(MID_HOUR - day_start(MID_HOUR) < 86_400);
    }

    #[test]
    fn month_start_is_first_of_month() {
        // 2024-03-01 00:00:00 UTC
        assert_eq!(month_start(MID_HOUR), 1_709_251_200);
        // Already at the boundary: fixed point.
        assert_eq!(month_start(1_709_251_200), 1_709_251_200);
    }

    #[test]
    fn month_start_handles_january() {
        // 2024-01-20 12:00:00 UTC → 2024-01-01 00:00:00 UTC
        assert_eq!(month_start(1_705_752_000), 1_704_067_200);
    }

    #[test]
    fn weight_at_half_hour_is_half() {
        assert!((previous_hour_weight(MID_HOUR) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn weight_bounds() {
        let top_of_hour = hour_start(MID_HOUR);
        assert!((previous_hour_weight(top_of_hour) - 1.0).abs() < f64::EPSILON);
        let last_minute = top_of_hour + 59 * 60;
        let w = previous_hour_weight(last_minute);
        assert!(w > 0.0 && w < 0.02 + 1.0 / 60.0);
    }

    #[test]
    fn retry_after_next_hour() {
        assert_eq!(secs_to_next_hour(MID_HOUR), 1800);
        assert_eq!(secs_to_next_hour(hour_start(MID_HOUR)), 3600);
    }

    #[test]
    fn retry_after_midnight() {
        let into_day = MID_HOUR % 86_400;
        assert_eq!(secs_to_next_midnight(MID_HOUR), 86_400 - into_day);
    }
}
