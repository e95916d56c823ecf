//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp into UTC.
///
/// Accepts the forms the realtime channel emits, e.g.
/// - "2026-01-31T12:45:31.053Z"
/// - "2026-01-31T12:45:31Z"
/// - "2026-01-31T12:45:31.053+00:00"
pub fn parse_rfc3339_utc(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// When a change happened: its commit time if parseable, otherwise now.
pub fn commit_time_or_now(commit_timestamp: Option<&str>) -> DateTime<Utc> {
    commit_timestamp
        .and_then(parse_rfc3339_utc)
        .unwrap_or_else(Utc::now)
}
