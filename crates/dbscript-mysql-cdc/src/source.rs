//! Replication source seam.
//!
//! The binlog protocol client lives outside this crate. It reports the current
//! end of the log, streams notifications from a starting position, and is torn
//! down when the listener closes.

use crate::ListenerOptions;
use async_trait::async_trait;
use dbscript_core::{BinlogPosition, Result, RowsEvent};

/// One notification from the replication stream
#[derive(Debug, Clone)]
pub enum Notification {
    /// Insert, update or delete rows, with the schema snapshot they were written under
    RowChange(RowsEvent),

    /// The server moved on to a new binlog file
    Rotate { next: BinlogPosition },

    /// A schema altering statement was applied at `position`
    SchemaChange {
        position: BinlogPosition,
        query: Option<String>,
    },

    /// A transaction committed; the stream may resume after `position`
    TransactionBoundary { position: BinlogPosition },

    /// Cached table metadata was refreshed
    TableChanged { schema: String, table: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::RowChange(_) => "row_change",
            Notification::Rotate { .. } => "rotate",
            Notification::SchemaChange { .. } => "schema_change",
            Notification::TransactionBoundary { .. } => "transaction_boundary",
            Notification::TableChanged { .. } => "table_changed",
        }
    }
}

/// Reports the coordinates the stream currently ends at
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionProvider: Send + Sync {
    async fn current_position(&self) -> Result<BinlogPosition>;
}

/// A replication session delivering notifications on one sequential path.
///
/// Failures are reported as [`dbscript_core::DbscriptError::Upstream`].
#[async_trait]
pub trait ReplicationSource: PositionProvider {
    /// Register as replica `options.server_id` on `options.address()` and open
    /// the session at `from`, replicating only tables accepted by `options.filter`.
    async fn start(&mut self, from: &BinlogPosition, options: &ListenerOptions) -> Result<()>;

    /// Next notification, `None` when the stream has ended.
    ///
    /// Must be cancel safe: the listener races it against its shutdown signal.
    async fn next_notification(&mut self) -> Result<Option<Notification>>;

    /// Tear the session down. Called once, also when `start` was never reached.
    async fn close(&mut self) -> Result<()>;
}
