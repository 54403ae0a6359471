// Total normalization helpers for loosely typed chat payloads.
//
// Every function here has a fixed fallback and never panics, so the merge
// and filtering code can assume clean values.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Naive formats accepted in addition to RFC 3339. Values without an offset
/// are taken as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Normalize a user id for comparison.
///
/// Fallback: an absent id becomes `""`. Present ids are trimmed and
/// lowercased.
pub fn normalize_id(id: Option<&str>) -> String {
    id.map(|s| s.trim().to_lowercase()).unwrap_or_default()
}

/// Case-insensitive, null-safe id comparison. The empty id never matches
/// anything, including another empty id.
pub fn ids_match(a: Option<&str>, b: Option<&str>) -> bool {
    let a = normalize_id(a);
    !a.is_empty() && a == normalize_id(b)
}

/// Parse a JSON timestamp into a UTC instant.
///
/// Strings may be RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]`; numbers are epoch
/// milliseconds. Fallback: `None` for anything else, including out-of-range
/// numbers and non-finite floats.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// String half of [`parse_timestamp`].
pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// The instant a message sorts by: `timestamp` if it parses, else
/// `created_at` if it parses, else `now`.
pub fn effective_timestamp(
    timestamp: Option<&Value>,
    created_at: Option<&Value>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    timestamp
        .and_then(parse_timestamp)
        .or_else(|| created_at.and_then(parse_timestamp))
        .unwrap_or(now)
}
