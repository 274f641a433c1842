//! Version-stamped row storage with optimistic concurrency control.
//!
//! Every row carries a monotonically increasing `version`. A cell mutation
//! submits the version it read; the write commits only if that version still
//! matches, as a single conditional update, and bumps the version by exactly
//! one. A mismatch means the row changed underneath the caller and comes
//! back as [`CollabError::VersionConflict`] — never a silent overwrite. No
//! lock is held between a client's read and its write; losers re-fetch and
//! retry at the application layer.
//!
//! Successful mutations publish a `row_update` (with the new version) on the
//! project channel so every viewer converges.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::{project_channel, MemoryBus};
use crate::error::CollabError;
use crate::protocol::ServerEvent;

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Boolean,
    Datetime,
}

impl ColumnType {
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
        }
    }

    /// Convert an incoming JSON value to this column's type.
    ///
    /// Booleans accept case-insensitive "true"/"yes"/"1" and
    /// "false"/"no"/"0"; datetimes require an ISO-8601 string and are
    /// normalized. Values already of the right JSON type pass through.
    pub fn convert(self, value: &Value) -> Result<Value, CollabError> {
        let fail = |reason: &str| CollabError::InvalidCellValue {
            column_type: self.name().to_owned(),
            reason: reason.to_owned(),
        };

        match self {
            Self::String => match value {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(fail("expected a scalar")),
            },
            Self::Int => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map(Value::from)
                    .ok_or_else(|| fail("number out of range")),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| fail("not an integer")),
                _ => Err(fail("expected an integer")),
            },
            Self::Float => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| fail("number out of range")),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::from)
                    .ok_or_else(|| fail("not a number")),
                _ => Err(fail("expected a number")),
            },
            Self::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Number(n) => Ok(Value::Bool(n.as_f64() != Some(0.0))),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(fail("invalid boolean value")),
                },
                _ => Err(fail("expected a boolean")),
            },
            Self::Datetime => match value {
                Value::String(s) => parse_iso8601(s)
                    .map(Value::String)
                    .ok_or_else(|| fail("datetime must be a string in ISO format")),
                _ => Err(fail("datetime must be a string in ISO format")),
            },
        }
    }
}

/// Normalize an ISO-8601 timestamp, with or without a UTC offset.
fn parse_iso8601(s: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_rfc3339());
    }
    s.parse::<NaiveDateTime>()
        .ok()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

/// One data row: payload plus its concurrency token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Row {
    pub id: Uuid,
    pub version: i64,
    pub data: serde_json::Map<String, Value>,
}

struct Table {
    columns: HashMap<String, ColumnType>,
    rows: HashMap<Uuid, Row>,
}

/// Row store with conditional, version-checked writes.
pub struct RowStore {
    bus: Arc<MemoryBus>,
    tables: Mutex<HashMap<Uuid, Table>>,
}

impl RowStore {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Register a table and its column schema.
    pub async fn create_table(
        &self,
        table_id: Uuid,
        columns: impl IntoIterator<Item = (String, ColumnType)>,
    ) {
        let mut tables = self.tables.lock().await;
        tables.insert(
            table_id,
            Table {
                columns: columns.into_iter().collect(),
                rows: HashMap::new(),
            },
        );
    }

    /// Insert a row at version 1.
    pub async fn insert_row(
        &self,
        table_id: Uuid,
        row_id: Uuid,
        data: serde_json::Map<String, Value>,
    ) -> Result<(), CollabError> {
        let mut tables = self.tables.lock().await;
        let table = tables.get_mut(&table_id).ok_or(CollabError::NotFound("table"))?;
        table.rows.insert(row_id, Row { id: row_id, version: 1, data });
        Ok(())
    }

    /// Fetch a row snapshot (id, version, data).
    pub async fn get_row(&self, table_id: Uuid, row_id: Uuid) -> Result<Row, CollabError> {
        let tables = self.tables.lock().await;
        tables
            .get(&table_id)
            .ok_or(CollabError::NotFound("table"))?
            .rows
            .get(&row_id)
            .cloned()
            .ok_or(CollabError::NotFound("row"))
    }

    /// Declared type of a column.
    pub async fn get_column(
        &self,
        table_id: Uuid,
        column_name: &str,
    ) -> Result<ColumnType, CollabError> {
        let tables = self.tables.lock().await;
        tables
            .get(&table_id)
            .ok_or(CollabError::NotFound("table"))?
            .columns
            .get(column_name)
            .copied()
            .ok_or(CollabError::NotFound("column"))
    }

    /// Mutate one cell, guarded by the submitted row version.
    ///
    /// Validates the column, converts the value to the declared type, then
    /// performs a single conditional update matching both row identity and
    /// `expected_version`. Returns the new version on success; publishes the
    /// mutation on the project channel only then.
    pub async fn update_cell(
        &self,
        project_id: Uuid,
        view_id: Uuid,
        table_id: Uuid,
        row_id: Uuid,
        column_name: &str,
        value: Value,
        expected_version: i64,
    ) -> Result<i64, CollabError> {
        let (new_version, converted) = {
            let mut tables = self.tables.lock().await;
            let table = tables.get_mut(&table_id).ok_or(CollabError::NotFound("table"))?;
            let column_type = table
                .columns
                .get(column_name)
                .copied()
                .ok_or(CollabError::NotFound("column"))?;
            let converted = column_type.convert(&value)?;

            let row = table.rows.get_mut(&row_id).ok_or(CollabError::NotFound("row"))?;
            // The conditional write: identity already matched, version must too.
            if row.version != expected_version {
                return Err(CollabError::VersionConflict);
            }
            row.data.insert(column_name.to_owned(), converted.clone());
            row.version += 1;
            (row.version, converted)
        };

        let event = ServerEvent::RowUpdate {
            row_id,
            column_name: column_name.to_owned(),
            value: converted,
            row_version: new_version,
            view_id,
        };
        self.bus
            .publish(&project_channel(project_id), event.encode()?)
            .await?;
        Ok(new_version)
    }
}
