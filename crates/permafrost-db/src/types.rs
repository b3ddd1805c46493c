//! Value and row types for permafrost-db
//!
//! Archived tables are discovered at runtime, so rows are modeled as ordered
//! column → value maps rather than a compile-time schema. The primary-key and
//! date columns are located by name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// SQL value type that can hold any database value the engine moves around
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Extract the date component, if this value carries one.
    ///
    /// Cutoff semantics are date-only, so datetime values are truncated and
    /// textual values are accepted when they lead with an ISO `YYYY-MM-DD`.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(dt) => Some(dt.date()),
            Self::DateTimeTz(dt) => Some(dt.naive_utc().date()),
            Self::String(s) => NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    /// Canonical string form used to compare primary keys across tiers.
    ///
    /// Returns `None` for NULL and for blank strings; the engine treats both
    /// as unusable keys.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Self::Bytes(b) => {
                if b.is_empty() {
                    None
                } else {
                    Some(b.iter().map(|byte| format!("{byte:02x}")).collect())
                }
            }
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            Self::Uuid(u) => Some(u.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    /// Column names, in source order
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int32(0).is_null());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int64(1).as_bool(), Some(true));
        assert_eq!(Value::String("no".into()).as_bool(), Some(false));
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::String("7".into()).as_i64(), Some(7));
    }

    #[test]
    fn test_as_date() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(Value::Date(d).as_date(), Some(d));
        assert_eq!(
            Value::DateTime(d.and_hms_opt(13, 30, 0).unwrap()).as_date(),
            Some(d)
        );
        assert_eq!(Value::String("2024-03-05".into()).as_date(), Some(d));
        assert_eq!(Value::String("2024-03-05 13:30:00".into()).as_date(), Some(d));
        assert_eq!(Value::String("not a date".into()).as_date(), None);
        assert_eq!(Value::Int64(5).as_date(), None);
    }

    #[test]
    fn test_key_string() {
        assert_eq!(Value::Null.key_string(), None);
        assert_eq!(Value::String("  ".into()).key_string(), None);
        assert_eq!(Value::Int64(42).key_string(), Some("42".into()));
        assert_eq!(Value::String(" a ".into()).key_string(), Some("a".into()));

        let u = Uuid::new_v4();
        assert_eq!(Value::Uuid(u).key_string(), Some(u.to_string()));
    }

    #[test]
    fn test_row_operations() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int32(1), Value::String("Alice".into())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int32(1)));
        assert_eq!(row.get_by_name("name"), Some(&Value::String("Alice".into())));
        // case-insensitive
        assert_eq!(row.get_by_name("NAME"), Some(&Value::String("Alice".into())));
        assert_eq!(row.get_by_name("missing"), None);
    }
}
