//! Runtime values

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Canonical text form for datetimes
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Current field values of one form, keyed by field name
pub type FormData = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("Number {0} cannot be represented as a decimal")]
    NumberOutOfRange(String),
}

/// A value flowing through formulas and form data
///
/// Numbers are decimals so money arithmetic never picks up binary
/// floating point drift.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Decimal),
    String(String),
    DateTime(NaiveDateTime),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// Type tag attached to evaluation results and function signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    DateTime,
    Array,
    Object,
    /// Accepts any value (signatures only)
    Any,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::DateTime => "datetime",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, blank text, or an empty collection
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Datetime values, or text in one of the accepted datetime layouts
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            Value::String(s) => parse_datetime(s),
            _ => None,
        }
    }

    /// Member lookup on objects
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Ordering between values of compatible types
    ///
    /// Returns `None` when the pair has no meaningful order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::String(b)) => parse_datetime(b).map(|b| a.cmp(&b)),
            (Value::String(a), Value::DateTime(b)) => parse_datetime(a).map(|a| a.cmp(b)),
            _ => None,
        }
    }

    /// Equality used by `==` in formulas: datetimes compare against
    /// datetime text, everything else structurally
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::DateTime(_), Value::String(_)) | (Value::String(_), Value::DateTime(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }

    /// Text rendering used by string functions
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::Array(_) | Value::Object(_) => {
                let json = serde_json::Value::from(self.clone());
                write!(f, "{}", json)
            }
        }
    }
}

/// Parse the datetime layouts accepted in form data and formulas
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN));
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_utc())
}

fn decimal_from_json(number: &serde_json::Number) -> Result<Decimal, ValueError> {
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ValueError::NumberOutOfRange(number.to_string()))
}

fn decimal_to_json(number: Decimal) -> serde_json::Value {
    let normalized = number.normalize();
    if normalized.scale() == 0 {
        if let Some(int) = normalized.to_i64() {
            return serde_json::Value::from(int);
        }
    }
    let text = normalized.to_string();
    match text.parse::<serde_json::Number>() {
        Ok(n) => serde_json::Value::Number(n),
        Err(_) => serde_json::Value::String(text),
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(decimal_from_json(&n)?),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                    .collect::<Result<_, ValueError>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => decimal_to_json(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::DateTime(dt) => serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Decimal::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Decimal::from(n))
    }
}

impl From<Decimal> for Value {
    fn from(n: Decimal) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_numbers_are_decimal() {
        let value = Value::try_from(json!(9.99)).unwrap();
        assert_eq!(value, Value::Number(Decimal::new(999, 2)));

        let value = Value::try_from(json!(3)).unwrap();
        assert_eq!(value, Value::from(3));
    }

    #[test]
    fn test_json_nested_roundtrip() {
        let input = json!({"customer": {"name": "Ada", "tags": ["a", "b"]}, "qty": 2});
        let value = Value::try_from(input.clone()).unwrap();
        assert_eq!(value.get("customer").and_then(|c| c.get("name")), Some(&Value::from("Ada")));
        assert_eq!(serde_json::Value::from(value), input);
    }

    #[test]
    fn test_decimal_to_json_keeps_fraction() {
        let json = serde_json::Value::from(Value::Number(Decimal::new(2997, 2)));
        assert_eq!(json, json!(29.97));

        let json = serde_json::Value::from(Value::Number(Decimal::new(500, 2)));
        assert_eq!(json, json!(5));
    }

    #[test]
    fn test_json_keeps_high_precision_decimals() {
        let exact = Decimal::from_str("12345678901234567.891").unwrap();
        let json = serde_json::to_string(&Value::Number(exact)).unwrap();
        assert_eq!(json, "12345678901234567.891");

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Number(exact));

        let data: Value = serde_json::from_str(r#"{"amount": 0.1000000000000000000001}"#).unwrap();
        assert_eq!(
            data.get("amount"),
            Some(&Value::Number(Decimal::from_str("0.1000000000000000000001").unwrap()))
        );
    }

    #[test]
    fn test_parse_datetime_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parse_datetime("2024-01-31"), Some(expected));
        assert_eq!(parse_datetime("2024-01-31T00:00:00"), Some(expected));
        assert_eq!(parse_datetime("2024-01-31T00:00:00Z"), Some(expected));
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn test_compare_mixed_types() {
        assert_eq!(Value::from(2).compare(&Value::from(10)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::from(1).compare(&Value::from("1")), None);

        let dt = parse_datetime("2024-03-01").unwrap();
        assert!(Value::DateTime(dt).loose_eq(&Value::from("2024-03-01")));
    }

    #[test]
    fn test_is_empty() {
        assert!(Value::Null.is_empty());
        assert!(Value::from("   ").is_empty());
        assert!(Value::Array(vec![]).is_empty());
        assert!(!Value::from(0).is_empty());
        assert!(!Value::Bool(false).is_empty());
    }

    #[test]
    fn test_deserialize_from_json() {
        let value: Value = serde_json::from_str(r#"{"price": 9.99, "active": true}"#).unwrap();
        assert_eq!(value.get("price"), Some(&Value::Number(Decimal::new(999, 2))));
        assert_eq!(value.get("active"), Some(&Value::Bool(true)));
        assert_eq!(value.value_type(), ValueType::Object);
    }
}
