//! Timestamp helpers.
//!
//! All persisted message timestamps are Unix timestamps (seconds since
//! epoch, as `f64`) to avoid parsing overhead and format drift between
//! the storage layer and the transport layer.

use chrono::{DateTime, Utc};

/// Current time as a Unix timestamp in fractional seconds.
pub fn unix_timestamp() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert a `DateTime<Utc>` to a Unix timestamp in fractional seconds.
pub fn to_unix_timestamp(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1_000_000.0
}

/// UTC timestamp string used for archive directory names
/// (e.g. `20260801_142530_123456`).
pub fn archive_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_timestamp_is_recent() {
        let ts = unix_timestamp();
        // Sometime after 2024 and before 2100.
        assert!(ts > 1_700_000_000.0);
        assert!(ts < 4_100_000_000.0);
    }

    #[test]
    fn test_to_unix_timestamp_round_trip() {
        let now = Utc::now();
        let ts = to_unix_timestamp(now);
        assert!((ts - now.timestamp() as f64).abs() < 1.0);
    }

    #[test]
    fn test_archive_timestamp_format() {
        let ts = archive_timestamp();
        // YYYYMMDD_HHMMSS_ffffff
        assert_eq!(ts.len(), 22);
        assert_eq!(ts.chars().filter(|c| *c == '_').count(), 2);
    }
}
