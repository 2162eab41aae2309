use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Column types the engine knows how to stage, bind and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Bool,
    Integer,
    Bigint,
    Double,
    Numeric,
    Text,
    Bytea,
    #[serde(alias = "timestamp")]
    TimestampTz,
    Jsonb,
}

impl SqlType {
    /// Returns the PostgreSQL type string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Bool => "BOOL",
            SqlType::Integer => "INTEGER",
            SqlType::Bigint => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Numeric => "NUMERIC",
            SqlType::Text => "TEXT",
            SqlType::Bytea => "BYTEA",
            SqlType::TimestampTz => "TIMESTAMPTZ",
            SqlType::Jsonb => "JSONB",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::Bigint | SqlType::Double | SqlType::Numeric)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, SqlType::Text)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("can not convert {value} to {expected}")]
pub struct CoerceError {
    pub value: String,
    pub expected: SqlType,
}

/// A single column value as staged into, or read back from, the store.
#[derive(Debug, Clone, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Numeric(Decimal),
    Text(String),
    Bytea(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn raw_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::Int(_) => "Int",
            SqlValue::BigInt(_) => "BigInt",
            SqlValue::Double(_) => "Double",
            SqlValue::Numeric(_) => "Numeric",
            SqlValue::Text(_) => "Text",
            SqlValue::Bytea(_) => "Bytea",
            SqlValue::Timestamp(_) => "Timestamp",
            SqlValue::Json(_) => "Json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The natural column type of this value, `None` for NULL.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(_) => Some(SqlType::Bool),
            SqlValue::Int(_) => Some(SqlType::Integer),
            SqlValue::BigInt(_) => Some(SqlType::Bigint),
            SqlValue::Double(_) => Some(SqlType::Double),
            SqlValue::Numeric(_) => Some(SqlType::Numeric),
            SqlValue::Text(_) => Some(SqlType::Text),
            SqlValue::Bytea(_) => Some(SqlType::Bytea),
            SqlValue::Timestamp(_) => Some(SqlType::TimestampTz),
            SqlValue::Json(_) => Some(SqlType::Jsonb),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            SqlValue::Numeric(v) if v.fract().is_zero() => v.to_i64(),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Int(v) => Some(Decimal::from(*v)),
            SqlValue::BigInt(v) => Some(Decimal::from(*v)),
            SqlValue::Numeric(v) => Some(*v),
            SqlValue::Double(v) => Decimal::from_f64_retain(*v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(f64::from(*v)),
            SqlValue::BigInt(v) => Some(*v as f64),
            SqlValue::Numeric(v) => v.to_f64(),
            SqlValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts the value into the exact representation used for `target`.
    ///
    /// NULL coerces to every type; nullability is checked by the caller.
    pub fn coerce(&self, target: SqlType) -> Result<SqlValue, CoerceError> {
        let fail = || CoerceError { value: self.to_string(), expected: target };

        let coerced = match (self, target) {
            (SqlValue::Null, _) => SqlValue::Null,
            (SqlValue::Bool(v), SqlType::Bool) => SqlValue::Bool(*v),
            (SqlValue::Int(v), SqlType::Integer) => SqlValue::Int(*v),
            (SqlValue::BigInt(v), SqlType::Integer) => {
                SqlValue::Int(i32::try_from(*v).map_err(|_| fail())?)
            }
            (SqlValue::Int(_) | SqlValue::BigInt(_), SqlType::Bigint) => {
                SqlValue::BigInt(self.as_i64().ok_or_else(fail)?)
            }
            (SqlValue::Numeric(_), SqlType::Integer) => {
                let v = self.as_i64().ok_or_else(fail)?;
                SqlValue::Int(i32::try_from(v).map_err(|_| fail())?)
            }
            (SqlValue::Numeric(_), SqlType::Bigint) => SqlValue::BigInt(self.as_i64().ok_or_else(fail)?),
            (SqlValue::Int(_) | SqlValue::BigInt(_) | SqlValue::Numeric(_), SqlType::Double) => {
                SqlValue::Double(self.as_f64().ok_or_else(fail)?)
            }
            (SqlValue::Double(v), SqlType::Double) => SqlValue::Double(*v),
            (
                SqlValue::Int(_) | SqlValue::BigInt(_) | SqlValue::Double(_) | SqlValue::Numeric(_),
                SqlType::Numeric,
            ) => SqlValue::Numeric(self.as_decimal().ok_or_else(fail)?),
            (SqlValue::Text(v), SqlType::Text) => SqlValue::Text(v.clone()),
            (SqlValue::Text(v), SqlType::Numeric) => {
                SqlValue::Numeric(Decimal::from_str(v).map_err(|_| fail())?)
            }
            (SqlValue::Text(v), SqlType::TimestampTz) => SqlValue::Timestamp(
                DateTime::parse_from_rfc3339(v).map_err(|_| fail())?.with_timezone(&Utc),
            ),
            (SqlValue::Text(v), SqlType::Jsonb) => SqlValue::Json(JsonValue::String(v.clone())),
            (SqlValue::Bytea(v), SqlType::Bytea) => SqlValue::Bytea(v.clone()),
            (SqlValue::Timestamp(v), SqlType::TimestampTz) => SqlValue::Timestamp(*v),
            (SqlValue::Json(v), SqlType::Jsonb) => SqlValue::Json(v.clone()),
            (other, SqlType::Jsonb) => SqlValue::Json(other.to_json()),
            _ => return Err(fail()),
        };

        Ok(coerced)
    }

    /// Builds a value of `target` type from a JSON document value.
    pub fn from_json(value: &JsonValue, target: SqlType) -> Result<SqlValue, CoerceError> {
        let fail = || CoerceError { value: value.to_string(), expected: target };

        match (value, target) {
            (JsonValue::Null, _) => Ok(SqlValue::Null),
            (_, SqlType::Jsonb) => Ok(SqlValue::Json(value.clone())),
            (JsonValue::Bool(v), SqlType::Bool) => Ok(SqlValue::Bool(*v)),
            (JsonValue::Number(n), _) => {
                let raw = if let Some(v) = n.as_i64() {
                    SqlValue::BigInt(v)
                } else if let Some(v) = n.as_f64() {
                    SqlValue::Double(v)
                } else {
                    return Err(fail());
                };
                raw.coerce(target)
            }
            (JsonValue::String(s), SqlType::Bytea) => {
                let trimmed = s.strip_prefix("\\x").or_else(|| s.strip_prefix("0x")).unwrap_or(s);
                decode_hex(trimmed).map(SqlValue::Bytea).ok_or_else(fail)
            }
            (JsonValue::String(s), SqlType::Integer | SqlType::Bigint | SqlType::Double) => {
                let parsed: SqlValue = if let Ok(v) = s.parse::<i64>() {
                    SqlValue::BigInt(v)
                } else {
                    SqlValue::Double(s.parse::<f64>().map_err(|_| fail())?)
                };
                parsed.coerce(target)
            }
            (JsonValue::String(s), SqlType::Bool) => match s.as_str() {
                "true" | "t" => Ok(SqlValue::Bool(true)),
                "false" | "f" => Ok(SqlValue::Bool(false)),
                _ => Err(fail()),
            },
            (JsonValue::String(s), _) => SqlValue::Text(s.clone()).coerce(target),
            _ => Err(fail()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(v) => JsonValue::Bool(*v),
            SqlValue::Int(v) => JsonValue::from(*v),
            SqlValue::BigInt(v) => JsonValue::from(*v),
            SqlValue::Double(v) => JsonValue::from(*v),
            SqlValue::Numeric(v) => JsonValue::String(v.to_string()),
            SqlValue::Text(v) => JsonValue::String(v.clone()),
            SqlValue::Bytea(v) => JsonValue::String(format!("\\x{}", encode_hex(v))),
            SqlValue::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
            SqlValue::Json(v) => v.clone(),
        }
    }

    /// SQL comparison semantics: numbers compare across widths, NULL compares
    /// with nothing, mismatched kinds are incomparable.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Null, _) | (_, SqlValue::Null) => None,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => Some(a.cmp(b)),
            (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
            (SqlValue::Bytea(a), SqlValue::Bytea(b)) => Some(a.cmp(b)),
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => Some(a.cmp(b)),
            (SqlValue::Json(a), SqlValue::Json(b)) => (a == b).then_some(Ordering::Equal),
            (SqlValue::Double(_), _) | (_, SqlValue::Double(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => Some(self.as_decimal()?.cmp(&other.as_decimal()?)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Bool(_) => 1,
            SqlValue::Int(_) => 2,
            SqlValue::BigInt(_) => 3,
            SqlValue::Double(_) => 4,
            SqlValue::Numeric(_) => 5,
            SqlValue::Text(_) => 6,
            SqlValue::Bytea(_) => 7,
            SqlValue::Timestamp(_) => 8,
            SqlValue::Json(_) => 9,
        }
    }
}

// Structural equality, so coerced values can be used as hash and tree keys.
impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SqlValue {}

impl PartialOrd for SqlValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SqlValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a.cmp(b),
            (SqlValue::Int(a), SqlValue::Int(b)) => a.cmp(b),
            (SqlValue::BigInt(a), SqlValue::BigInt(b)) => a.cmp(b),
            (SqlValue::Double(a), SqlValue::Double(b)) => a.total_cmp(b),
            (SqlValue::Numeric(a), SqlValue::Numeric(b)) => a.cmp(b),
            (SqlValue::Text(a), SqlValue::Text(b)) => a.cmp(b),
            (SqlValue::Bytea(a), SqlValue::Bytea(b)) => a.cmp(b),
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => a.cmp(b),
            (SqlValue::Json(a), SqlValue::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            SqlValue::Null => {}
            SqlValue::Bool(v) => v.hash(state),
            SqlValue::Int(v) => v.hash(state),
            SqlValue::BigInt(v) => v.hash(state),
            SqlValue::Double(v) => v.to_bits().hash(state),
            SqlValue::Numeric(v) => v.normalize().hash(state),
            SqlValue::Text(v) => v.hash(state),
            SqlValue::Bytea(v) => v.hash(state),
            SqlValue::Timestamp(v) => v.hash(state),
            SqlValue::Json(v) => v.to_string().hash(state),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::BigInt(v) => write!(f, "{}", v),
            SqlValue::Double(v) => write!(f, "{}", v),
            SqlValue::Numeric(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v),
            SqlValue::Bytea(v) => write!(f, "\\x{}", encode_hex(v)),
            SqlValue::Timestamp(v) => write!(f, "'{}'", v.to_rfc3339()),
            SqlValue::Json(v) => write!(f, "{}", v),
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok()).collect()
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Double(value)
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        SqlValue::Numeric(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Bytea(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        SqlValue::Json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Ascending order with NULLs last, the way Postgres sorts by default.
pub fn compare_nulls_last(a: Option<&SqlValue>, b: Option<&SqlValue>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.compare(b).unwrap_or_else(|| a.cmp(b)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_coerce_widens_integers() {
        assert_eq!(SqlValue::Int(7).coerce(SqlType::Bigint).unwrap(), SqlValue::BigInt(7));
        assert_eq!(
            SqlValue::BigInt(7).coerce(SqlType::Numeric).unwrap(),
            SqlValue::Numeric(Decimal::from(7))
        );
        assert!(SqlValue::BigInt(i64::MAX).coerce(SqlType::Integer).is_err());
    }

    #[test]
    fn test_coerce_text_to_timestamp() {
        let value = SqlValue::from("2024-01-01T00:00:00Z").coerce(SqlType::TimestampTz).unwrap();
        assert!(matches!(value, SqlValue::Timestamp(_)));
        assert!(SqlValue::from("yesterday").coerce(SqlType::TimestampTz).is_err());
    }

    #[test]
    fn test_coerce_rejects_mismatched_kinds() {
        let err = SqlValue::Bool(true).coerce(SqlType::Bigint).unwrap_err();
        assert_eq!(err.expected, SqlType::Bigint);
        assert!(SqlValue::from("abc").coerce(SqlType::Bool).is_err());
    }

    #[test]
    fn test_null_coerces_to_anything() {
        assert_eq!(SqlValue::Null.coerce(SqlType::Bytea).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_compare_across_numeric_widths() {
        assert_eq!(SqlValue::Int(3).compare(&SqlValue::BigInt(3)), Some(Ordering::Equal));
        assert_eq!(SqlValue::Int(3).compare(&SqlValue::Double(3.5)), Some(Ordering::Less));
        assert_eq!(SqlValue::Null.compare(&SqlValue::Null), None);
        assert_eq!(SqlValue::from("a").compare(&SqlValue::Int(1)), None);
    }

    #[test]
    fn test_values_work_as_set_keys() {
        let mut keys = HashSet::new();
        assert!(keys.insert(vec![SqlValue::from("A-1"), SqlValue::from("a@x.io")]));
        assert!(!keys.insert(vec![SqlValue::from("A-1"), SqlValue::from("a@x.io")]));
        assert!(keys.insert(vec![SqlValue::from("A-1"), SqlValue::from("b@x.io")]));
        assert!(keys.insert(vec![SqlValue::Double(f64::NAN)]));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(SqlValue::from_json(&json!(5), SqlType::Bigint).unwrap(), SqlValue::BigInt(5));
        assert_eq!(
            SqlValue::from_json(&json!("0x0aff"), SqlType::Bytea).unwrap(),
            SqlValue::Bytea(vec![0x0a, 0xff])
        );
        assert_eq!(
            SqlValue::from_json(&json!({"a": 1}), SqlType::Jsonb).unwrap(),
            SqlValue::Json(json!({"a": 1}))
        );
        assert!(SqlValue::from_json(&json!("nope"), SqlType::Integer).is_err());
    }

    #[test]
    fn test_to_json_round_trips_bytea_notation() {
        assert_eq!(SqlValue::Bytea(vec![1, 2]).to_json(), json!("\\x0102"));
    }

    #[test]
    fn test_nulls_sort_last() {
        let mut values = vec![SqlValue::Null, SqlValue::Int(2), SqlValue::BigInt(1)];
        values.sort_by(|a, b| compare_nulls_last(Some(a), Some(b)));
        assert_eq!(values, vec![SqlValue::BigInt(1), SqlValue::Int(2), SqlValue::Null]);
    }
}
