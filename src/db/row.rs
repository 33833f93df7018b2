//! Backend-neutral statement parameters and result rows.
//!
//! Both backends bind [`SqlValue`] parameters and return [`Row`]s, so the
//! repository, blackboard and migration code is written once.

use crate::error::{Result, StorageError};

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Any integer column.
    Integer(i64),
    /// Floating point column.
    Real(f64),
    /// Text column.
    Text(String),
    /// Binary column.
    Blob(Vec<u8>),
}

impl SqlValue {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<&[u8]> for SqlValue {
    fn from(value: &[u8]) -> Self {
        Self::Blob(value.to_vec())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Builds a parameter slice, like `rusqlite::params!` for [`SqlValue`].
#[macro_export]
macro_rules! values {
    () => {
        &[] as &[$crate::db::SqlValue]
    };
    ($($value:expr),+ $(,)?) => {
        &[$($crate::db::SqlValue::from($value)),+] as &[$crate::db::SqlValue]
    };
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    /// Wraps column values in a row.
    pub const fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> Result<&SqlValue> {
        self.values.get(index).ok_or_else(|| {
            StorageError::TypeMismatch {
                index,
                expected: "column",
                found: "out of range",
            }
            .into()
        })
    }

    /// Typed value at `index`.
    pub fn get<T: FromSqlValue>(&self, index: usize) -> Result<T> {
        T::from_sql_value(self.value(index)?, index)
    }
}

/// Conversion from a column value.
pub trait FromSqlValue: Sized {
    /// Converts `value` (column `index`) into `Self`.
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self>;
}

fn mismatch(value: &SqlValue, index: usize, expected: &'static str) -> crate::error::Error {
    StorageError::TypeMismatch {
        index,
        expected,
        found: value.kind(),
    }
    .into()
}

impl FromSqlValue for i64 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        match value {
            SqlValue::Integer(v) => Ok(*v),
            // Legacy stores occasionally hold integral REAL values.
            SqlValue::Real(v) if v.fract() == 0.0 => Ok(*v as Self),
            other => Err(mismatch(other, index, "integer")),
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        let wide = i64::from_sql_value(value, index)?;
        Self::try_from(wide).map_err(|_| mismatch(value, index, "32-bit integer"))
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        Ok(i64::from_sql_value(value, index)? != 0)
    }
}

impl FromSqlValue for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        match value {
            SqlValue::Real(v) => Ok(*v),
            SqlValue::Integer(v) => Ok(*v as Self),
            other => Err(mismatch(other, index, "real")),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        match value {
            SqlValue::Text(v) => Ok(v.clone()),
            other => Err(mismatch(other, index, "text")),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        match value {
            SqlValue::Blob(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.as_bytes().to_vec()),
            other => Err(mismatch(other, index, "blob")),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue, index: usize) -> Result<Self> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other, index).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_macro_converts() {
        let params = values![1_i64, "a", None::<i64>, vec![1_u8, 2], 2.5_f64, true];
        assert_eq!(params[0], SqlValue::Integer(1));
        assert_eq!(params[1], SqlValue::Text("a".to_string()));
        assert_eq!(params[2], SqlValue::Null);
        assert_eq!(params[3], SqlValue::Blob(vec![1, 2]));
        assert_eq!(params[4], SqlValue::Real(2.5));
        assert_eq!(params[5], SqlValue::Integer(1));
        assert!(values![].is_empty());
    }

    #[test]
    fn test_row_typed_access() {
        let row = Row::new(vec![
            SqlValue::Integer(7),
            SqlValue::Null,
            SqlValue::Text("x".to_string()),
        ]);
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get::<i32>(0).unwrap(), 7);
        assert_eq!(row.get::<Option<i64>>(1).unwrap(), None);
        assert_eq!(row.get::<String>(2).unwrap(), "x");
        assert!(row.get::<i64>(2).is_err());
        assert!(row.get::<i64>(5).is_err());
    }

    #[test]
    fn test_i32_overflow_is_mismatch() {
        let row = Row::new(vec![SqlValue::Integer(i64::MAX)]);
        assert!(row.get::<i32>(0).is_err());
    }
}
