//! Error types for dbscript core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbscriptError {
    #[error("update on {database}.{table} carries {rows} rows, missing paired after row")]
    MissingPairedRow {
        database: String,
        table: String,
        rows: usize,
    },

    #[error("unsupported rows action: {0}")]
    UnsupportedOperation(String),

    #[error("row for {table} has {row_len} values, primary key column index {index} is out of range")]
    RowShorterThanPrimaryKey {
        table: String,
        index: usize,
        row_len: usize,
    },

    #[error("stream cancelled")]
    Cancelled,

    #[error("{0} queue closed, its consumer is gone")]
    QueueClosed(&'static str),

    #[error("upstream replication error: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("listener is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DbscriptError>;

impl DbscriptError {
    /// Wrap a failure reported by the replication collaborator.
    pub fn upstream<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DbscriptError::Upstream(err.into())
    }

    /// Errors that end the active listening session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbscriptError::MissingPairedRow { .. }
                | DbscriptError::UnsupportedOperation(_)
                | DbscriptError::RowShorterThanPrimaryKey { .. }
                | DbscriptError::Upstream(_)
                | DbscriptError::QueueClosed(_)
        )
    }

    /// Expected during shutdown, not an operator-facing failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DbscriptError::Cancelled)
    }
}

impl From<anyhow::Error> for DbscriptError {
    fn from(err: anyhow::Error) -> Self {
        DbscriptError::Internal(err.to_string())
    }
}
