//! Typed structured fields attached to a normalized log entry.
//!
//! Field types are decided once, at normalization time. Consumers look values
//! up with explicit defaults instead of probing dynamic JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Convert a JSON value into a scalar, or `None` for null/arrays/objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FieldValue::Int(i))
                } else {
                    n.as_f64().map(FieldValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(FieldValue::Str(s.clone())),
            _ => None,
        }
    }

    /// Infer a scalar from unquoted text (logfmt values).
    pub fn infer(text: &str) -> Self {
        if let Ok(i) = text.parse::<i64>() {
            return FieldValue::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() {
                return FieldValue::Float(f);
            }
        }
        match text {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => FieldValue::Str(text.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Result of looking up a numeric field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericLookup {
    /// The key is absent.
    Missing,
    /// The key holds a finite number (numeric strings are accepted).
    Value(f64),
    /// The key is present but does not hold a usable number.
    NotNumeric,
}

/// Ordered mapping of field name to scalar value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// String value of `key`, or `default` when absent or not a string.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(FieldValue::as_str).unwrap_or(default)
    }

    /// Numeric lookup distinguishing "absent" from "present but unusable".
    pub fn numeric(&self, key: &str) -> NumericLookup {
        match self.get(key) {
            None => NumericLookup::Missing,
            Some(FieldValue::Int(i)) => NumericLookup::Value(*i as f64),
            Some(FieldValue::Float(f)) if f.is_finite() => NumericLookup::Value(*f),
            Some(FieldValue::Str(s)) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => NumericLookup::Value(f),
                _ => NumericLookup::NotNumeric,
            },
            Some(_) => NumericLookup::NotNumeric,
        }
    }

    /// Numeric value of `key`, or `default` when absent or unusable.
    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        match self.numeric(key) {
            NumericLookup::Value(v) => v,
            _ => default,
        }
    }
}

impl FromIterator<(String, FieldValue)> for Fields {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Fields(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_lookup_semantics() {
        let mut fields = Fields::new();
        fields.insert("latency_ms", FieldValue::Int(42));
        fields.insert("ratio", FieldValue::Str(" 0.5 ".into()));
        fields.insert("user", FieldValue::Str("alice".into()));
        fields.insert("ok", FieldValue::Bool(true));

        assert_eq!(fields.numeric("latency_ms"), NumericLookup::Value(42.0));
        assert_eq!(fields.numeric("ratio"), NumericLookup::Value(0.5));
        assert_eq!(fields.numeric("user"), NumericLookup::NotNumeric);
        assert_eq!(fields.numeric("ok"), NumericLookup::NotNumeric);
        assert_eq!(fields.numeric("absent"), NumericLookup::Missing);
        assert_eq!(fields.f64_or("user", -1.0), -1.0);
        assert_eq!(fields.str_or("user", "nobody"), "alice");
        assert_eq!(fields.str_or("latency_ms", "nobody"), "nobody");
    }

    #[test]
    fn test_infer_scalar_types() {
        assert_eq!(FieldValue::infer("200"), FieldValue::Int(200));
        assert_eq!(FieldValue::infer("1.25"), FieldValue::Float(1.25));
        assert_eq!(FieldValue::infer("true"), FieldValue::Bool(true));
        assert_eq!(FieldValue::infer("NaN"), FieldValue::Str("NaN".into()));
        assert_eq!(FieldValue::infer("GET"), FieldValue::Str("GET".into()));
    }

    #[test]
    fn test_json_roundtrip_keeps_types() {
        let mut fields = Fields::new();
        fields.insert("a", FieldValue::Int(7));
        fields.insert("b", FieldValue::Float(2.5));
        fields.insert("c", FieldValue::Str("x".into()));
        fields.insert("d", FieldValue::Bool(false));

        let json = serde_json::to_string(&fields).unwrap();
        let back: Fields = serde_json::from_str(&json).unwrap();
        assert_eq!(fields, back);
    }
}
