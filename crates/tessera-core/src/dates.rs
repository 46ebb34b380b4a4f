//! Date handling shared by the update, relationship, and rule engines.
//!
//! Dates are stored as RFC 3339 UTC strings with millisecond precision.
//! Open validity bounds are represented by two sentinel instants.

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde_json::Value;

/// Open start of a validity interval ("since the beginning of time").
pub const FROM_START: &str = "1970-01-01T00:00:00.000Z";

/// Open end of a validity interval ("until the end of time").
pub const UNTIL_END: &str = "5138-11-16T09:46:40.000Z";

const FROM_START_MILLIS: i64 = 0;
const UNTIL_END_MILLIS: i64 = 100_000_000_000_000;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn format(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn now_string() -> String {
    format(&now())
}

pub fn from_start() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(FROM_START_MILLIS).unwrap_or_default()
}

pub fn until_end() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(UNTIL_END_MILLIS).unwrap_or_default()
}

/// Parse a JSON value as a date.
///
/// Accepts RFC 3339 strings, plain `YYYY-MM-DD` dates, and epoch milliseconds.
pub fn parse(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

pub fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Re-format a date value canonically, or `None` when it is not a date.
pub fn normalize(value: &Value) -> Option<String> {
    parse(value).map(|d| format(&d))
}

/// Whether the value is one of the open-interval sentinels.
pub fn is_sentinel(value: &Value) -> bool {
    match parse(value) {
        Some(d) => {
            let millis = d.timestamp_millis();
            millis == FROM_START_MILLIS || millis == UNTIL_END_MILLIS
        }
        None => false,
    }
}

/// Whether the value carries no usable date: absent, empty, or a sentinel.
pub fn is_open(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) if s.is_empty() => true,
        Some(v) => is_sentinel(v),
    }
}

/// Shift a date by a signed number of months, saturating at the calendar limits.
pub fn shift_months(date: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    let delta = Months::new(months.unsigned_abs());
    let shifted = if months >= 0 {
        date.checked_add_months(delta)
    } else {
        date.checked_sub_months(delta)
    };
    shifted.unwrap_or(date)
}

/// Day, month, and year shadow fields for a stats date.
pub fn shadow_fields(key: &str, value: &Value) -> Vec<(String, Value)> {
    let parsed = parse(value);
    let render = |pattern: &str| {
        parsed
            .map(|d| Value::String(d.format(pattern).to_string()))
            .unwrap_or(Value::Null)
    };
    vec![
        (format!("i_{key}_day"), render("%Y-%m-%d")),
        (format!("i_{key}_month"), render("%Y-%m")),
        (format!("i_{key}_year"), render("%Y")),
    ]
}
