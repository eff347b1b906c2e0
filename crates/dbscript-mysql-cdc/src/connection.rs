//! Metadata connection to the primary

use crate::PositionProvider;
use async_trait::async_trait;
use dbscript_core::{BinlogPosition, DbscriptError, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, Pool, Row};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// MySQL connection manager for everything outside the binlog stream itself
pub struct MySqlConnectionManager {
    pool: Pool<MySql>,
}

impl MySqlConnectionManager {
    /// Create a new connection manager
    #[instrument(skip(options))]
    pub async fn new(options: MySqlConnectOptions, max_connections: u32) -> Result<Self> {
        info!("Creating MySQL connection pool");

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DbscriptError::Database(format!("Failed to create pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Test database connectivity
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbscriptError::Database(format!("Connection test failed: {}", e)))?;

        Ok(())
    }

    /// Check if binlog is enabled
    pub async fn is_binlog_enabled(&self) -> Result<bool> {
        Ok(self
            .show_variable("log_bin")
            .await?
            .map(|value| value.eq_ignore_ascii_case("on"))
            .unwrap_or(false))
    }

    /// Get binlog format
    pub async fn get_binlog_format(&self) -> Result<String> {
        self.show_variable("binlog_format")
            .await?
            .ok_or_else(|| DbscriptError::Database("binlog_format is not reported".into()))
    }

    /// Row images are only available with binary logging on and ROW format.
    pub async fn verify_replication_prerequisites(&self) -> Result<()> {
        if !self.is_binlog_enabled().await? {
            return Err(DbscriptError::Config(
                "binary logging is disabled on the server".into(),
            ));
        }

        let format = self.get_binlog_format().await?;
        if !format.eq_ignore_ascii_case("row") {
            return Err(DbscriptError::Config(format!(
                "binlog_format is {format}, ROW is required"
            )));
        }

        Ok(())
    }

    async fn show_variable(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SHOW VARIABLES LIKE ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbscriptError::Database(format!("Failed to read {name}: {e}")))?;

        row.map(|row| {
            row.try_get::<String, _>("Value")
                .map_err(|e| DbscriptError::Database(format!("Failed to decode {name}: {e}")))
        })
        .transpose()
    }

    async fn binlog_status(&self) -> Result<Option<MySqlRow>> {
        // MySQL 8.2+ renamed the statement; older servers only know the legacy one.
        match sqlx::query("SHOW BINARY LOG STATUS")
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => Ok(row),
            Err(e) => {
                debug!(error = %e, "SHOW BINARY LOG STATUS failed, falling back");
                sqlx::query("SHOW MASTER STATUS")
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| {
                        DbscriptError::upstream(format!("Failed to query binlog position: {e}"))
                    })
            }
        }
    }
}

#[async_trait]
impl PositionProvider for MySqlConnectionManager {
    async fn current_position(&self) -> Result<BinlogPosition> {
        let row = self.binlog_status().await?.ok_or_else(|| {
            DbscriptError::upstream("binlog status returned no rows, binary logging may be disabled")
        })?;

        let filename: String = row
            .try_get("File")
            .map_err(|e| DbscriptError::upstream(format!("Failed to decode binlog file: {e}")))?;
        let position: u64 = row
            .try_get("Position")
            .map_err(|e| DbscriptError::upstream(format!("Failed to decode binlog position: {e}")))?;

        if filename.is_empty() {
            return Err(DbscriptError::upstream(
                "binlog status returned an empty filename",
            ));
        }

        let position = u32::try_from(position).map_err(|_| {
            DbscriptError::upstream(format!("binlog position {position} exceeds 32 bits"))
        })?;

        Ok(BinlogPosition::new(filename, position))
    }
}
