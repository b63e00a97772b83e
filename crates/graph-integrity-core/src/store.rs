use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("cannot decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn decode(column: &str, reason: impl Into<String>) -> Self {
        Self::Decode { column: column.to_string(), reason: reason.into() }
    }
}

/// A single bound parameter or returned column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
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

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(value: &[u8]) -> Self {
        Self::Blob(value.to_vec())
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: BTreeMap<String, SqlValue>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.insert(column.into(), value);
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.columns.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Read a non-null text column.
    ///
    /// # Errors
    /// Returns a decode error when the column is absent, null, or not text.
    pub fn text(&self, column: &str) -> Result<String, StoreError> {
        match self.opt_text(column)? {
            Some(value) => Ok(value),
            None => Err(StoreError::decode(column, "expected text, found null")),
        }
    }

    /// Read a nullable text column.
    ///
    /// # Errors
    /// Returns a decode error when the column is absent or holds a non-text value.
    pub fn opt_text(&self, column: &str) -> Result<Option<String>, StoreError> {
        match self.columns.get(column) {
            None => Err(StoreError::decode(column, "column missing from row")),
            Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Text(value)) => Ok(Some(value.clone())),
            Some(other) => Err(StoreError::decode(
                column,
                format!("expected text, found {}", other.type_name()),
            )),
        }
    }

    /// Read an integer column.
    ///
    /// # Errors
    /// Returns a decode error when the column is absent or not an integer.
    pub fn i64(&self, column: &str) -> Result<i64, StoreError> {
        match self.columns.get(column) {
            None => Err(StoreError::decode(column, "column missing from row")),
            Some(SqlValue::Integer(value)) => Ok(*value),
            Some(other) => Err(StoreError::decode(
                column,
                format!("expected integer, found {}", other.type_name()),
            )),
        }
    }

    /// Read a numeric column as `f64`; integers are widened.
    ///
    /// # Errors
    /// Returns a decode error when the column is absent or not numeric.
    #[allow(clippy::cast_precision_loss)]
    pub fn f64(&self, column: &str) -> Result<f64, StoreError> {
        match self.columns.get(column) {
            None => Err(StoreError::decode(column, "column missing from row")),
            Some(SqlValue::Real(value)) => Ok(*value),
            Some(SqlValue::Integer(value)) => Ok(*value as f64),
            Some(other) => Err(StoreError::decode(
                column,
                format!("expected real, found {}", other.type_name()),
            )),
        }
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self { columns: iter.into_iter().collect() }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationOutcome {
    pub affected_rows: usize,
    pub last_insert_id: Option<i64>,
}

/// The narrow relational contract the integrity subsystem needs from its host.
///
/// Calls are synchronous and never retried by the caller; implementations must be
/// shareable across threads because manual and scheduled repair sessions may run at once.
pub trait RelationalStore: Send + Sync {
    /// Run a query that yields at most one row.
    ///
    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError>;

    /// Run a query and collect every matching row.
    ///
    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;

    /// Run a mutation and report affected rows, plus the new rowid when it inserted one.
    ///
    /// # Errors
    /// Returns an error when the statement cannot be prepared or executed.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<MutationOutcome, StoreError>;
}
