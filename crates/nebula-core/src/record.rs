//! Typed record values for tenant tables.
//!
//! Values arrive as JSON and are converted into a [`FieldValue`] according to the
//! column's declared [`ColumnType`]. The same type converts to and from SQLite
//! values so the storage layer never handles untyped JSON.

use crate::{ColumnType, NebulaError, Result};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Convert a JSON value into the variant required by `column_type`.
    ///
    /// `column` is only used in error messages.
    pub fn from_json(column: &str, column_type: ColumnType, value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        if value.is_null() {
            return Ok(FieldValue::Null);
        }

        let mismatch = || {
            NebulaError::ValidationError(format!(
                "Column '{}' expects {}, got {}",
                column,
                column_type,
                json_kind(value)
            ))
        };

        match column_type {
            ColumnType::Text => match value {
                Value::String(s) => Ok(FieldValue::Text(s.clone())),
                _ => Err(mismatch()),
            },
            ColumnType::Integer => value.as_i64().map(FieldValue::Integer).ok_or_else(mismatch),
            ColumnType::Float => value.as_f64().map(FieldValue::Float).ok_or_else(mismatch),
            ColumnType::Boolean => value.as_bool().map(FieldValue::Boolean).ok_or_else(mismatch),
            ColumnType::Timestamp => {
                let s = value.as_str().ok_or_else(mismatch)?;
                chrono::DateTime::parse_from_rfc3339(s).map_err(|e| {
                    NebulaError::ValidationError(format!(
                        "Column '{}' expects an RFC 3339 timestamp: {}",
                        column, e
                    ))
                })?;
                Ok(FieldValue::Text(s.to_string()))
            }
            ColumnType::Uuid => {
                let s = value.as_str().ok_or_else(mismatch)?;
                uuid::Uuid::parse_str(s).map_err(|e| {
                    NebulaError::ValidationError(format!(
                        "Column '{}' expects a UUID: {}",
                        column, e
                    ))
                })?;
                Ok(FieldValue::Text(s.to_string()))
            }
            ColumnType::Json => Ok(FieldValue::Json(value.clone())),
        }
    }

    /// Read a SQLite value back, using the declared type when one is known.
    pub fn from_sql(value: ValueRef<'_>, column_type: Option<ColumnType>) -> Result<Self> {
        let converted = match (value, column_type) {
            (ValueRef::Null, _) => FieldValue::Null,
            (ValueRef::Integer(i), Some(ColumnType::Boolean)) => FieldValue::Boolean(i != 0),
            (ValueRef::Integer(i), Some(ColumnType::Float)) => FieldValue::Float(i as f64),
            (ValueRef::Integer(i), _) => FieldValue::Integer(i),
            (ValueRef::Real(f), _) => FieldValue::Float(f),
            (ValueRef::Text(bytes), Some(ColumnType::Json)) => {
                FieldValue::Json(serde_json::from_slice(bytes)?)
            }
            (ValueRef::Text(bytes), _) => FieldValue::Text(
                std::str::from_utf8(bytes)
                    .map_err(|e| NebulaError::SerializationError(e.to_string()))?
                    .to_string(),
            ),
            (ValueRef::Blob(bytes), _) => FieldValue::Text(hex::encode(bytes)),
        };
        Ok(converted)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl rusqlite::ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let out = match self {
            FieldValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            FieldValue::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            FieldValue::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            FieldValue::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Json(v) => ToSqlOutput::Owned(SqlValue::Text(
                serde_json::to_string(v)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            )),
        };
        Ok(out)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A row of a tenant table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, FieldValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.0.insert(column.into(), value)
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.0.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
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

    /// The record's `id` column, if set.
    pub fn id(&self) -> Option<&str> {
        self.get(crate::ID_COLUMN).and_then(FieldValue::as_str)
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
