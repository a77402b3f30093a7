use chrono::format::StrftimeItems;
use chrono::{DateTime, NaiveDateTime};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// current timestamp
pub fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// now_nanos returns the wall clock as unix nanoseconds.
pub fn now_nanos() -> i64 {
    now().as_nanos() as i64
}

/// unix_nano_to_time converts unix nanoseconds to a calendar time. Values outside of the
/// representable range clamp to the epoch.
pub fn unix_nano_to_time(unix_nano: i64) -> NaiveDateTime {
    let secs = unix_nano.div_euclid(1_000_000_000);
    let nsecs = unix_nano.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

pub fn time_format(dt: NaiveDateTime) -> String {
    let fmt = StrftimeItems::new("%Y-%m-%d %H:%M:%S%.9f");
    format!("{}", dt.format_with_items(fmt))
}
