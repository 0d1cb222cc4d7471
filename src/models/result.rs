use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::SemanticType;

/// A typed cell value. Timestamps are UTC epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    Vector(Vec<f32>),
}

impl Value {
    /// Semantic type of a non-null value.
    pub fn semantic_type(&self) -> Option<SemanticType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(SemanticType::Text),
            Value::Integer(_) => Some(SemanticType::Integer),
            Value::Float(_) => Some(SemanticType::Float),
            Value::Boolean(_) => Some(SemanticType::Boolean),
            Value::Timestamp(_) => Some(SemanticType::Timestamp),
            Value::Vector(_) => Some(SemanticType::Vector),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Infer a value from an adapter's JSON cell. Nested objects are kept as JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                let floats: Option<Vec<f32>> =
                    items.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
                match floats {
                    Some(vector) => Value::Vector(vector),
                    None => Value::Text(value.to_string()),
                }
            }
            serde_json::Value::Object(_) => Value::Text(value.to_string()),
        }
    }

    /// Plain JSON rendering for callers; timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Timestamp(ms) => DateTime::<Utc>::from_timestamp_millis(*ms)
                .map(|dt| serde_json::Value::String(dt.to_rfc3339()))
                .unwrap_or_else(|| serde_json::Value::from(*ms)),
            Value::Vector(v) => serde_json::Value::from(v.clone()),
        }
    }
}

/// One row of the unified result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub fields: BTreeMap<String, Value>,
    /// Id of the operation the row was produced by.
    pub provenance: String,
}

impl ResultRow {
    pub fn new(provenance: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            provenance: provenance.into(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_inference() {
        assert_eq!(Value::from_json(&json!(7)), Value::Integer(7));
        assert_eq!(Value::from_json(&json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from_json(&json!("x")), Value::Text("x".into()));
        assert_eq!(Value::from_json(&json!([0.5, 1])), Value::Vector(vec![0.5, 1.0]));
        assert_eq!(
            Value::from_json(&json!({"a": 1})),
            Value::Text("{\"a\":1}".into())
        );
        assert!(Value::from_json(&json!(null)).is_null());
    }

    #[test]
    fn test_timestamp_renders_rfc3339() {
        let rendered = Value::Timestamp(0).to_json();
        assert_eq!(rendered, json!("1970-01-01T00:00:00+00:00"));
    }

    #[test]
    fn test_row_to_json() {
        let row = ResultRow::new("fetch_users")
            .with("id", Value::Integer(1))
            .with("name", Value::Text("a".into()));
        assert_eq!(row.to_json(), json!({"id": 1, "name": "a"}));
        assert_eq!(row.provenance, "fetch_users");
    }
}
