//! Observability features: structured logging and metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Global observability system
static OBSERVABILITY: OnceCell<ObservabilitySystem> = OnceCell::new();

/// Observability system for centralized logging and metrics
#[derive(Debug)]
pub struct ObservabilitySystem {
    metrics_enabled: bool,
}

impl ObservabilitySystem {
    /// Initialize the observability system
    pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
        if OBSERVABILITY.get().is_some() {
            anyhow::bail!("Observability system already initialized");
        }

        Self::init_logging(&config.logging)?;

        if config.metrics.enabled {
            Self::init_metrics(&config.metrics)?;
        }

        OBSERVABILITY
            .set(Self {
                metrics_enabled: config.metrics.enabled,
            })
            .map_err(|_| anyhow::anyhow!("Observability system already initialized"))?;

        info!("Observability system initialized");
        Ok(())
    }

    /// Initialize structured logging
    fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
        let env_filter = EnvFilter::builder()
            .with_default_directive(parse_level(&config.level).into())
            .from_env_lossy();

        let registry = tracing_subscriber::registry().with(env_filter);

        match config.format.to_lowercase().as_str() {
            "json" => {
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(json_layer).try_init()?;
            }
            _ => {
                let pretty_layer = tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::CLOSE);
                registry.with(pretty_layer).try_init()?;
            }
        }

        Ok(())
    }

    /// Install the Prometheus exporter and its scrape endpoint.
    ///
    /// Must be called from within a tokio runtime.
    fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = config.bind_address.parse()?;

        PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()?;

        info!("Prometheus metrics initialized on {}", bind_addr);
        Ok(())
    }

    /// Get the global observability system
    pub fn get() -> Option<&'static ObservabilitySystem> {
        OBSERVABILITY.get()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Change stream metrics
pub struct EventMetrics;

impl EventMetrics {
    /// Record events produced from one rows notification
    pub fn events_translated(database: &str, table: &str, change_type: &str, count: usize) {
        counter!("dbscript_events_translated_total",
                "database" => database.to_string(),
                "table" => table.to_string(),
                "type" => change_type.to_string())
            .increment(count as u64);
    }

    /// Record a batch handed to the change event queue
    pub fn batch_enqueued(events: usize) {
        counter!("dbscript_batches_enqueued_total").increment(1);
        histogram!("dbscript_batch_size").record(events as f64);
    }

    /// Record a save-point handed to the save-point queue
    pub fn savepoint_emitted(force: bool) {
        let kind = if force { "forced" } else { "periodic" };
        counter!("dbscript_savepoints_emitted_total", "kind" => kind).increment(1);
    }

    /// Record the outcome a handler reported for one batch
    pub fn handler_outcome(handler: &str, outcome: &str) {
        counter!("dbscript_handler_outcomes_total",
                "handler" => handler.to_string(),
                "outcome" => outcome.to_string())
            .increment(1);
    }

    /// Record current queue size
    pub fn queue_size(size: usize, queue: &str) {
        gauge!("dbscript_queue_size", "queue" => queue.to_string()).set(size as f64);
    }

    /// Record an error that ended the listening session
    pub fn fatal_error(kind: &str) {
        counter!("dbscript_fatal_errors_total", "kind" => kind.to_string()).increment(1);
    }
}

/// Performance timer helper, records into a histogram on drop
pub struct PerfTimer {
    start: Instant,
    metric_name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl PerfTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let labels: Vec<metrics::Label> = self
                .labels
                .iter()
                .map(|(key, value)| metrics::Label::new(*key, value.clone()))
                .collect();
            histogram!(self.metric_name, labels).record(self.start.elapsed().as_secs_f64());
        }
    }
}
