//! Epoch-millisecond timestamps.
//!
//! SQLite rows store `i64` epoch milliseconds; API responses render RFC 3339.

use chrono::{DateTime, Utc};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render an epoch-ms timestamp as RFC 3339. Out-of-range values (which
/// cannot come from our own writes) degrade to the epoch.
pub fn to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap_or_default())
        .to_rfc3339()
}

pub fn from_rfc3339(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}
