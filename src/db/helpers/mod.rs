use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// Unix timestamps delimiting `[local midnight of day, +24h)`.
pub fn day_bounds(day: NaiveDate) -> (i64, i64) {
    let start = local_midnight(day);
    (start, start + 86_400)
}

fn local_midnight(day: NaiveDate) -> i64 {
    let naive = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        // A local midnight skipped by a DST jump; fall back to the UTC wall time.
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive).timestamp())
}

pub fn from_unix_ts(ts: i64) -> Result<DateTime<Local>> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| anyhow!("timestamp {ts} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn day_bounds_span_exactly_one_day() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let (start, end) = day_bounds(day);
        assert_eq!(end - start, 86_400);
    }

    #[test]
    fn day_bounds_start_at_local_midnight() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let (start, _) = day_bounds(day);
        let dt = from_unix_ts(start).unwrap();
        assert_eq!(dt.hour(), 0);
        assert_eq!(dt.minute(), 0);
        assert_eq!(dt.second(), 0);
        assert_eq!(dt.date_naive(), day);
    }

    #[test]
    fn from_unix_ts_round_trips() {
        let dt = from_unix_ts(1_700_000_000).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }
}
