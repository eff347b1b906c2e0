//! Change event model shared by the listener, the translator and the consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Column name to value image of a single row.
pub type RowImage = HashMap<String, Value>;

/// Events produced from one underlying rows notification, in row order.
pub type ChangeBatch = Vec<ChangeEvent>;

/// Kind of row mutation carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed row mutation with before/after state and primary key identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Database (schema) the table lives in
    pub database: String,

    /// Table name
    pub table: String,

    /// Mutation kind
    #[serde(rename = "type")]
    pub change_type: ChangeType,

    /// Binlog event timestamp (seconds since epoch)
    #[serde(rename = "ts")]
    pub timestamp: u32,

    /// Log position of the originating binlog event
    pub position: u32,

    /// Server id of the originating server
    pub server_id: u32,

    /// Primary key values, aligned with `primary_key_columns`
    #[serde(rename = "pk")]
    pub primary_key: Vec<Value>,

    /// Primary key column names in key order
    #[serde(rename = "pk_columns")]
    pub primary_key_columns: Vec<String>,

    /// Row state before the mutation (updates and deletes)
    pub before: Option<RowImage>,

    /// Row state after the mutation (inserts and updates)
    pub after: Option<RowImage>,
}

impl ChangeEvent {
    /// Partition-style identity: `database.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Provenance header of a binlog event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub timestamp: u32,
    pub server_id: u32,
    pub log_pos: u32,
}

impl EventHeader {
    pub fn new(timestamp: u32, server_id: u32, log_pos: u32) -> Self {
        Self {
            timestamp,
            server_id,
            log_pos,
        }
    }
}

/// Coarse column type as reported by the replication source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Number,
    Float,
    Enum,
    Set,
    String,
    Datetime,
    Timestamp,
    Date,
    Time,
    Bit,
    Json,
    Decimal,
    MediumInt,
    Binary,
    Point,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Column list and primary key layout in effect for one notification.
///
/// Supplied by the replication source with every rows event; never cached here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchemaSnapshot {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// Indices into `columns`, in key order
    pub pk_columns: Vec<usize>,
}

impl TableSchemaSnapshot {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(TableColumn {
            name: name.into(),
            column_type,
        });
        self
    }

    pub fn with_primary_key(mut self, index: usize) -> Self {
        self.pk_columns.push(index);
        self
    }

    /// Primary key column names. Indices outside the column list are skipped.
    pub fn primary_key_names(&self) -> Vec<String> {
        self.pk_columns
            .iter()
            .filter_map(|&idx| self.columns.get(idx))
            .map(|col| col.name.clone())
            .collect()
    }
}

/// Rows action of a rows notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
    /// Anything the translator does not know how to reconstruct
    Other(String),
}

impl From<&str> for RowAction {
    fn from(action: &str) -> Self {
        match action.to_ascii_lowercase().as_str() {
            "insert" => RowAction::Insert,
            "update" => RowAction::Update,
            "delete" => RowAction::Delete,
            other => RowAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowAction::Insert => f.write_str("insert"),
            RowAction::Update => f.write_str("update"),
            RowAction::Delete => f.write_str("delete"),
            RowAction::Other(action) => f.write_str(action),
        }
    }
}

/// Raw rows notification as delivered by the replication source
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table: Arc<TableSchemaSnapshot>,
    pub action: RowAction,
    /// Raw row tuples; updates alternate before/after rows
    pub rows: Vec<Vec<Value>>,
    pub header: EventHeader,
}

impl RowsEvent {
    pub fn new(
        table: Arc<TableSchemaSnapshot>,
        action: impl Into<RowAction>,
        rows: Vec<Vec<Value>>,
        header: EventHeader,
    ) -> Self {
        Self {
            table,
            action: action.into(),
            rows,
            header,
        }
    }
}

/// Binlog coordinates the stream can be resumed from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub filename: String,
    pub position: u32,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u32) -> Self {
        Self {
            filename: filename.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// Resumption marker handed to the position persistence consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavePoint {
    pub position: BinlogPosition,

    /// Set on rotation and schema change boundaries: persist now
    pub force: bool,

    pub created_at: DateTime<Utc>,
}

impl SavePoint {
    pub fn new(position: BinlogPosition, force: bool) -> Self {
        Self {
            position,
            force,
            created_at: Utc::now(),
        }
    }

    pub fn forced(position: BinlogPosition) -> Self {
        Self::new(position, true)
    }

    pub fn periodic(position: BinlogPosition) -> Self {
        Self::new(position, false)
    }
}
