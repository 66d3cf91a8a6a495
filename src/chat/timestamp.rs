//! Timestamp normalization
//!
//! History and live payloads carry time as epoch seconds, epoch
//! milliseconds, numeric strings, ISO 8601 strings or browser locale
//! strings. Everything funnels through `normalize` so that ordering and
//! coalescing see one canonical value. The functions here are pure.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Values above this are already milliseconds; at or below are seconds
const MILLIS_THRESHOLD: f64 = 1e12;

/// Largest millisecond value that still fits an `i64`
const MAX_EPOCH_MS: f64 = i64::MAX as f64;

/// Naive (offset-less) layouts, interpreted as UTC
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y, %I:%M:%S %p",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y, %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Canonical message time
///
/// `Invalid` sorts after every valid instant, so a derived `Ord` gives the
/// timeline order directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum Timestamp {
    /// Epoch milliseconds
    At(i64),
    /// No representation could be parsed
    Invalid,
}

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Timestamp::At(Utc::now().timestamp_millis())
    }

    /// Epoch milliseconds, if valid
    pub fn millis(&self) -> Option<i64> {
        match self {
            Timestamp::At(ms) => Some(*ms),
            Timestamp::Invalid => None,
        }
    }

    /// Whether a valid instant was parsed
    pub fn is_valid(&self) -> bool {
        matches!(self, Timestamp::At(_))
    }

    /// Both valid and at most `window_ms` apart
    pub fn within(&self, other: &Timestamp, window_ms: i64) -> bool {
        match (self.millis(), other.millis()) {
            (Some(a), Some(b)) => (a - b).abs() <= window_ms,
            _ => false,
        }
    }
}

impl From<Option<i64>> for Timestamp {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Timestamp::Invalid, Timestamp::At)
    }
}

impl From<Timestamp> for Option<i64> {
    fn from(value: Timestamp) -> Self {
        value.millis()
    }
}

/// Normalize a raw time value, trying `fallback` when `raw` is unusable
pub fn normalize(raw: &Value, fallback: Option<&Value>) -> Timestamp {
    normalize_value(raw)
        .or_else(|| fallback.and_then(normalize_value))
        .map_or(Timestamp::Invalid, Timestamp::At)
}

/// Normalize a time string (numeric or calendar)
pub fn normalize_str(raw: &str) -> Timestamp {
    parse_str(raw).map_or(Timestamp::Invalid, Timestamp::At)
}

fn normalize_value(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_f64().and_then(from_magnitude),
        Value::String(s) => parse_str(s),
        _ => None,
    }
}

fn parse_str(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_numeric_literal(trimmed) {
        return trimmed.parse::<f64>().ok().and_then(from_magnitude);
    }
    parse_calendar(trimmed)
}

/// Digits with at most one interior decimal point
fn is_numeric_literal(s: &str) -> bool {
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in s.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit && !s.ends_with('.') && !s.starts_with('.')
}

fn from_magnitude(value: f64) -> Option<i64> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let ms = if value > MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    if ms >= MAX_EPOCH_MS {
        return None;
    }
    Some(ms.round() as i64)
}

fn parse_calendar(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp_millis());
    }
    if let Some(ms) = parse_js_date_string(s) {
        return Some(ms);
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    None
}

/// `Thu Oct 31 2024 08:00:00 GMT+0000 (Coordinated Universal Time)`
fn parse_js_date_string(s: &str) -> Option<i64> {
    let without_zone_name = match s.find(" (") {
        Some(idx) => &s[..idx],
        None => s,
    };
    DateTime::parse_from_str(without_zone_name, "%a %b %d %Y %H:%M:%S GMT%z")
        .ok()
        .map(|dt| dt.timestamp_millis())
}
