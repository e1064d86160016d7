use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::error::GateError;

pub const HOURLY_WINDOW_MINUTES: i64 = 60;

/// 当前自然月的起点（UTC，不带本地偏移，避免时区漂移）
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first day of month is always a valid UTC timestamp")
}

/// 下一自然月的起点，作为月度配额的重置时间
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first day of month is always a valid UTC timestamp")
}

// 小时窗口是滑动的：起点永远是 now - 60min，不做整点对齐
pub fn hour_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::minutes(HOURLY_WINDOW_MINUTES)
}

/// Epoch minute used to bucket usage inside the sliding hour window.
pub fn minute_of(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60)
}

pub fn parse_rfc3339_utc(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GateError::TimeParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_start_is_first_instant_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 15, 42, 9).unwrap();
        assert_eq!(
            month_start(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_month_start_rolls_over_december() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            next_month_start(now),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn last_instant_of_month_belongs_to_that_month() {
        let last = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap();
        let next = last + Duration::seconds(1);
        assert_eq!(month_start(last), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(month_start(next), Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn hour_window_is_sliding() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 15, 42, 9).unwrap();
        assert_eq!(
            hour_window_start(now),
            Utc.with_ymd_and_hms(2026, 3, 17, 14, 42, 9).unwrap()
        );
    }

    #[test]
    fn parse_rfc3339_utc_accepts_offset_forms() {
        let dt = parse_rfc3339_utc("2026-01-20T10:20:30Z").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2026, 1, 20, 10, 20, 30).unwrap());
        let dt = parse_rfc3339_utc("2026-01-20T18:20:30+08:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2026, 1, 20, 10, 20, 30).unwrap());
        assert!(parse_rfc3339_utc("2026-01-20 10:20:30").is_err());
    }
}
