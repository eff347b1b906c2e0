//! Listener construction options and table inclusion filter

use dbscript_core::BinlogPosition;
use dbscript_shared::DbscriptConfig;
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnectOptions;
use std::fmt;
use std::time::Duration;

/// Schema plus table selection handed to the replication source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilter {
    /// Schema (database) to replicate from
    pub schema: String,

    /// Table names or `*` patterns (empty = every table in the schema)
    pub tables: Vec<String>,
}

impl TableFilter {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            tables: Vec::new(),
        }
    }

    pub fn include_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Include regexes in `schema\.table` form, one per table
    pub fn include_patterns(&self) -> Vec<String> {
        if self.tables.is_empty() {
            return vec![format!("{}\\..*", self.schema)];
        }

        self.tables
            .iter()
            .map(|table| format!("{}\\.{}", self.schema, table.replace('*', ".*")))
            .collect()
    }

    /// Check if a table should be replicated
    pub fn matches(&self, database: &str, table: &str) -> bool {
        if database != self.schema {
            return false;
        }

        self.tables.is_empty()
            || self
                .tables
                .iter()
                .any(|pattern| table == pattern || matches_pattern(table, pattern))
    }
}

/// Simple pattern matching (supports a single `*` wildcard)
fn matches_pattern(text: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) if !suffix.contains('*') => {
            text.len() >= prefix.len() + suffix.len()
                && text.starts_with(prefix)
                && text.ends_with(suffix)
        }
        _ => false,
    }
}

/// Everything a [`crate::BinlogListener`] is constructed from.
///
/// `Debug` redacts the password.
#[derive(Clone)]
pub struct ListenerOptions {
    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: Option<String>,

    /// Server ID presented when registering as a replica
    pub server_id: u32,

    pub filter: TableFilter,

    /// Identity of the change event handler, for logs
    pub handler: String,

    /// Resume here instead of at the current end of the log
    pub start_position: Option<BinlogPosition>,

    pub event_queue_capacity: usize,

    pub savepoint_queue_capacity: usize,

    /// Periodic non-forced save-points on commit (disabled when unset)
    pub flush_interval: Option<Duration>,

    pub strict_primary_key: bool,
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("filter", &self.filter)
            .field("handler", &self.handler)
            .field("start_position", &self.start_position)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("savepoint_queue_capacity", &self.savepoint_queue_capacity)
            .field("flush_interval", &self.flush_interval)
            .field("strict_primary_key", &self.strict_primary_key)
            .finish()
    }
}

impl ListenerOptions {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            server_id: 1001,
            filter: TableFilter::new(schema),
            handler: "logging".to_string(),
            start_position: None,
            event_queue_capacity: 4096,
            savepoint_queue_capacity: 4096,
            flush_interval: None,
            strict_primary_key: false,
        }
    }

    pub fn from_config(config: &DbscriptConfig) -> Self {
        let source = &config.source;
        let start_position = source
            .binlog_filename
            .as_ref()
            .zip(source.binlog_position)
            .map(|(filename, position)| BinlogPosition::new(filename.clone(), position));

        Self {
            host: source.host.clone(),
            port: source.port,
            user: source.user.clone(),
            password: source.password.clone(),
            server_id: source.server_id,
            filter: TableFilter {
                schema: source.schema.clone(),
                tables: source.tables.clone(),
            },
            handler: config.handler.name.clone(),
            start_position,
            event_queue_capacity: config.pipeline.event_queue_capacity,
            savepoint_queue_capacity: config.pipeline.savepoint_queue_capacity,
            flush_interval: config.pipeline.flush_interval_secs.map(Duration::from_secs),
            strict_primary_key: config.pipeline.strict_primary_key,
        }
    }

    /// `host:port` of the primary
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection settings for metadata queries against the primary.
    ///
    /// Credentials are passed as-is, never through a URL.
    pub fn connect_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user);

        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = user.into();
        self.password = password;
        self
    }

    pub fn include_table(mut self, table: impl Into<String>) -> Self {
        self.filter = self.filter.include_table(table);
        self
    }

    pub fn with_start_position(mut self, position: BinlogPosition) -> Self {
        self.start_position = Some(position);
        self
    }

    pub fn with_queue_capacity(mut self, events: usize, savepoints: usize) -> Self {
        self.event_queue_capacity = events;
        self.savepoint_queue_capacity = savepoints;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn with_strict_primary_key(mut self, strict: bool) -> Self {
        self.strict_primary_key = strict;
        self
    }
}
