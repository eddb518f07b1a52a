//! Values crossing the connection boundary.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, ValueRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{DbError, DbResult};

/// A single SQL parameter or column value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(ByteBuf),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(v) => (*v).into(),
            SqlValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(v) => v.clone().into(),
            SqlValue::Blob(v) => serde_json::Value::Array(
                v.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

/// Booleans are stored as integers.
impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
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
        SqlValue::Blob(ByteBuf::from(value))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

impl From<&serde_json::Value> for SqlValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(v) => (*v).into(),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => SqlValue::Integer(v),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(v) => SqlValue::Text(v.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Integer(v),
            ValueRef::Real(v) => SqlValue::Real(v),
            ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => SqlValue::Blob(ByteBuf::from(v.to_vec())),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(v) => ValueRef::Integer(*v),
            SqlValue::Real(v) => ValueRef::Real(*v),
            SqlValue::Text(v) => ValueRef::Text(v.as_bytes()),
            SqlValue::Blob(v) => ValueRef::Blob(v.as_ref()),
        }))
    }
}

/// Result of one `execute` call, stored column-major by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub rows_affected: u64,
    pub insert_id: Option<i64>,
}

impl QueryResult {
    pub fn affected(rows_affected: u64, insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            insert_id,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Row> {
        let columns: Arc<[String]> = self.columns.into();
        self.rows
            .into_iter()
            .map(|values| Row {
                columns: columns.clone(),
                values,
            })
            .collect()
    }
}

/// One result row. Column order follows the statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|name| name == column)?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Deserializes the row as if it were a JSON object keyed by column name.
    pub fn deserialize<T: DeserializeOwned>(&self) -> DbResult<T> {
        let object: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|err| DbError::Protocol(format!("row does not match target type: {err}")))
    }
}

/// Tables touched since the last flush of change notifications.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub tables: Vec<String>,
}

impl TableChange {
    pub fn from_set(tables: BTreeSet<String>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    pub fn touches(&self, table: &str) -> bool {
        self.tables.iter().any(|name| name == table)
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryResult, SqlValue};
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Item {
        id: i64,
        title: String,
        done: i64,
    }

    #[test]
    fn rows_keep_column_order_and_deserialize() {
        let result = QueryResult {
            columns: vec!["id".into(), "title".into(), "done".into()],
            rows: vec![vec![1.into(), "write docs".into(), true.into()]],
            ..QueryResult::default()
        };
        let rows = result.into_rows();
        assert_eq!(rows[0].columns(), ["id", "title", "done"]);
        assert_eq!(rows[0].get("title").and_then(SqlValue::as_str), Some("write docs"));
        assert_eq!(rows[0].get("done"), Some(&SqlValue::Integer(1)));
        let item: Item = rows[0].deserialize().expect("row");
        assert_eq!(
            item,
            Item {
                id: 1,
                title: "write docs".into(),
                done: 1
            }
        );
    }

    #[test]
    fn json_values_bind_like_sqlite() {
        let value = serde_json::json!({"flag": true, "n": 2.5, "s": "x"});
        assert_eq!(SqlValue::from(&value["flag"]), SqlValue::Integer(1));
        assert_eq!(SqlValue::from(&value["n"]), SqlValue::Real(2.5));
        assert_eq!(SqlValue::from(&value["missing"]), SqlValue::Null);
    }
}
