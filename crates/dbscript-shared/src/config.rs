//! Configuration management for dbscript

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Main configuration structure for dbscript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbscriptConfig {
    /// Replication source configuration
    pub source: SourceConfig,

    /// Change event handler configuration
    pub handler: HandlerConfig,

    /// Queue and translation configuration
    pub pipeline: PipelineConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Connection target and table selection.
///
/// `Debug` redacts the password.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: Option<String>,

    /// Schema (database) the monitored tables live in
    pub schema: String,

    /// Tables to monitor (empty = every table in the schema)
    pub tables: Vec<String>,

    /// Server ID presented to the primary when registering as a replica
    pub server_id: u32,

    /// Binlog filename to start from instead of the current end of the log
    pub binlog_filename: Option<String>,

    /// Binlog position to start from, used together with `binlog_filename`
    pub binlog_position: Option<u32>,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("schema", &self.schema)
            .field("tables", &self.tables)
            .field("server_id", &self.server_id)
            .field("binlog_filename", &self.binlog_filename)
            .field("binlog_position", &self.binlog_position)
            .finish()
    }
}

impl SourceConfig {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Handler identity used in logs and metrics
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the change event batch queue
    pub event_queue_capacity: usize,

    /// Capacity of the save-point queue
    pub savepoint_queue_capacity: usize,

    /// Emit a non-forced save-point on commit when this many seconds have
    /// passed since the last one (disabled when unset)
    pub flush_interval_secs: Option<u64>,

    /// Fail on rows too short to carry the full primary key
    pub strict_primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json or pretty)
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Prometheus metrics bind address
    pub bind_address: String,
}

impl Default for DbscriptConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 3306,
                user: String::new(),
                password: None,
                schema: String::new(),
                tables: Vec::new(),
                server_id: 1001,
                binlog_filename: None,
                binlog_position: None,
            },
            handler: HandlerConfig {
                name: "logging".to_string(),
            },
            pipeline: PipelineConfig {
                event_queue_capacity: 4096,
                savepoint_queue_capacity: 4096,
                flush_interval_secs: None,
                strict_primary_key: false,
            },
            observability: ObservabilityConfig {
                logging: LoggingConfig {
                    level: "info".to_string(),
                    format: "json".to_string(),
                },
                metrics: MetricsConfig {
                    enabled: false,
                    bind_address: "0.0.0.0:9090".to_string(),
                },
            },
        }
    }
}

impl DbscriptConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("dbscript.toml")
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&DbscriptConfig::default())?);

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix("DBSCRIPT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("source.tables"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML text layered over the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(&DbscriptConfig::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the listener cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.user.is_empty() {
            return Err(ConfigError::Message("source.user is required".into()));
        }
        if self.source.schema.is_empty() {
            return Err(ConfigError::Message("source.schema is required".into()));
        }
        if self.pipeline.event_queue_capacity == 0 || self.pipeline.savepoint_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "pipeline queue capacities must be greater than zero".into(),
            ));
        }
        if self.source.binlog_filename.is_some() != self.source.binlog_position.is_some() {
            return Err(ConfigError::Message(
                "source.binlog_filename and source.binlog_position must be set together".into(),
            ));
        }
        Ok(())
    }
}
