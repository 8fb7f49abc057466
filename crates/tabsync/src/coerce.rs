//! Type coercion
//!
//! [`coerce`] is total: every raw value maps to a value of the declared field
//! type or to `Value::Null`. Unparseable numbers become null; unparseable
//! dates become the Unix epoch. Coercing an already coerced value returns it
//! unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tabsync_rdbc::types::Value;

use crate::field::FieldType;

/// Maximum length of a nominal value, in characters
pub const MAX_NOMINAL_CHARS: usize = 255;

/// Coerce a raw value to the canonical representation of `field_type`
pub fn coerce(raw: &Value, field_type: FieldType) -> Value {
    if raw.is_null() {
        return Value::Null;
    }

    match field_type {
        FieldType::Nominal => match raw.as_string() {
            Some(s) => Value::String(truncate_chars(s, MAX_NOMINAL_CHARS)),
            None => Value::Null,
        },
        FieldType::Text => raw.as_string().map(Value::String).unwrap_or(Value::Null),
        FieldType::Numeric => to_number(raw),
        FieldType::Logic => Value::Bool(to_bool(raw)),
        FieldType::Date => Value::DateTime(to_datetime(raw)),
    }
}

/// Coerce a JSON value to the canonical representation of `field_type`
pub fn coerce_json(raw: &serde_json::Value, field_type: FieldType) -> Value {
    coerce(&Value::from(raw), field_type)
}

/// Keep at most `max` characters of `s`
pub(crate) fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s,
    }
}

fn to_number(raw: &Value) -> Value {
    let n = match raw {
        Value::Int64(n) => Some(*n as f64),
        Value::Float64(n) => Some(*n),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::DateTime(dt) => Some(dt.timestamp_millis() as f64),
        Value::Bool(_) | Value::Null => None,
    };
    match n {
        Some(n) if n.is_finite() => Value::Float64(n),
        _ => Value::Null,
    }
}

fn to_bool(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("true") || s == "1" {
                true
            } else if s.eq_ignore_ascii_case("false") || s == "0" {
                false
            } else {
                !s.is_empty()
            }
        }
        Value::Int64(n) => *n != 0,
        Value::Float64(n) => *n != 0.0 && !n.is_nan(),
        Value::DateTime(_) => true,
        Value::Null => false,
    }
}

fn to_datetime(raw: &Value) -> DateTime<Utc> {
    let parsed = match raw {
        Value::DateTime(dt) => Some(*dt),
        Value::String(s) => parse_datetime(s.trim()),
        Value::Int64(ms) => DateTime::from_timestamp_millis(*ms),
        Value::Float64(ms) if ms.is_finite() => DateTime::from_timestamp_millis(*ms as i64),
        _ => None,
    };
    parsed.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
