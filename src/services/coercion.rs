// Value coercion between semantic types.
//
// The table is total over the six semantic types: each (from, to) pair either
// converts or is an explicit `UnsupportedCoercion`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::AggregationError;
use crate::models::{SemanticType, Value};

/// Parse a textual timestamp into UTC epoch milliseconds.
///
/// Accepts RFC 3339, naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` (taken as UTC) and plain dates.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn invalid(value: impl ToString, to: SemanticType, reason: &str) -> AggregationError {
    AggregationError::InvalidValue {
        value: value.to_string(),
        to,
        reason: reason.to_string(),
    }
}

fn unsupported(from: SemanticType, to: SemanticType) -> AggregationError {
    AggregationError::UnsupportedCoercion { from, to }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

fn timestamp_text(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Convert `value` to `to`. Null converts to Null for every target.
pub fn coerce(value: &Value, to: SemanticType) -> Result<Value, AggregationError> {
    use SemanticType as T;

    match value {
        Value::Null => Ok(Value::Null),

        Value::Text(s) => match to {
            T::Text => Ok(value.clone()),
            T::Integer => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| invalid(s, to, &e.to_string())),
            T::Float => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| invalid(s, to, &e.to_string())),
            T::Boolean => parse_bool(s)
                .map(Value::Boolean)
                .ok_or_else(|| invalid(s, to, "not a boolean literal")),
            T::Timestamp => parse_timestamp(s)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid(s, to, "unrecognised timestamp format")),
            T::Vector => serde_json::from_str::<Vec<f32>>(s.trim())
                .map(Value::Vector)
                .map_err(|e| invalid(s, to, &e.to_string())),
        },

        Value::Integer(i) => match to {
            T::Text => Ok(Value::Text(i.to_string())),
            T::Integer => Ok(value.clone()),
            T::Float => Ok(Value::Float(*i as f64)),
            T::Boolean => match i {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                _ => Err(invalid(i, to, "only 0 and 1 convert to boolean")),
            },
            T::Timestamp => Ok(Value::Timestamp(*i)),
            T::Vector => Err(unsupported(T::Integer, to)),
        },

        Value::Float(f) => match to {
            T::Text => Ok(Value::Text(f.to_string())),
            T::Integer => integral(*f)
                .map(Value::Integer)
                .ok_or_else(|| invalid(f, to, "not an integral value")),
            T::Float => Ok(value.clone()),
            T::Boolean => Err(unsupported(T::Float, to)),
            T::Timestamp => integral(*f)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid(f, to, "not an integral millisecond value")),
            T::Vector => Err(unsupported(T::Float, to)),
        },

        Value::Boolean(b) => match to {
            T::Text => Ok(Value::Text(b.to_string())),
            T::Integer => Ok(Value::Integer(*b as i64)),
            T::Float => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            T::Boolean => Ok(value.clone()),
            T::Timestamp | T::Vector => Err(unsupported(T::Boolean, to)),
        },

        Value::Timestamp(ms) => match to {
            T::Text => Ok(Value::Text(timestamp_text(*ms))),
            T::Integer => Ok(Value::Integer(*ms)),
            T::Timestamp => Ok(value.clone()),
            T::Float | T::Boolean | T::Vector => Err(unsupported(T::Timestamp, to)),
        },

        Value::Vector(v) => match to {
            T::Text => Ok(Value::Text(serde_json::Value::from(v.clone()).to_string())),
            T::Vector => Ok(value.clone()),
            T::Integer | T::Float | T::Boolean | T::Timestamp => Err(unsupported(T::Vector, to)),
        },
    }
}

/// Canonical type two join keys are compared in, if any.
pub fn comparable_key_type(left: SemanticType, right: SemanticType) -> Option<SemanticType> {
    use SemanticType as T;

    match (left, right) {
        (T::Vector, _) | (_, T::Vector) => None,
        (a, b) if a == b => Some(a),
        (T::Integer, T::Float) | (T::Float, T::Integer) => Some(T::Float),
        (T::Timestamp, T::Integer)
        | (T::Integer, T::Timestamp)
        | (T::Timestamp, T::Text)
        | (T::Text, T::Timestamp) => Some(T::Timestamp),
        (T::Text, T::Integer) | (T::Integer, T::Text) => Some(T::Text),
        _ => None,
    }
}

/// Hashable form of a coerced join key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Text(String),
    Int(i64),
    Bool(bool),
    FloatBits(u64),
}

/// Hash key for a value already coerced to its canonical type; `None` for null keys.
pub fn key_of(value: &Value) -> Option<KeyValue> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(KeyValue::Text(s.clone())),
        Value::Integer(i) | Value::Timestamp(i) => Some(KeyValue::Int(*i)),
        Value::Boolean(b) => Some(KeyValue::Bool(*b)),
        // -0.0 and 0.0 must land in the same bucket
        Value::Float(f) => Some(KeyValue::FloatBits(if *f == 0.0 { 0 } else { f.to_bits() })),
        Value::Vector(_) => None,
    }
}
