//! RFC-3339 UTC timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current instant as RFC-3339 UTC with microsecond precision.
pub fn now_ts_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC-3339 timestamp, tolerating both `Z` and `+00:00` suffixes.
pub fn parse_ts_utc(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds since the epoch for a timestamp string; `None` when the
/// string does not parse.
pub fn ts_utc_to_ms(ts: &str) -> Option<i64> {
    parse_ts_utc(ts).map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_both_offsets() {
        assert!(parse_ts_utc("2026-01-02T03:04:05Z").is_some());
        assert!(parse_ts_utc("2026-01-02T03:04:05+00:00").is_some());
        assert!(parse_ts_utc("not a time").is_none());
    }

    #[test]
    fn now_parses() {
        let ts = now_ts_utc();
        assert!(parse_ts_utc(&ts).is_some());
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn ms_conversion() {
        assert_eq!(ts_utc_to_ms("1970-01-01T00:00:01Z"), Some(1000));
    }
}
