//! `dbscript` — façade over `dbscript-core`, `dbscript-mysql-cdc` and
//! `dbscript-shared`, plus [`run`], which wires a listener to its consumers.

#![deny(missing_docs)]

/// Re-export **everything** from dbscript-core at the crate root, so users can `use dbscript::*;`.
#[doc(inline)]
pub use dbscript_core::*;

/// The MySQL binlog listener.
pub use dbscript_mysql_cdc as mysql;

/// Configuration and observability.
pub use dbscript_shared as shared;

use dbscript_mysql_cdc::{
    BinlogListener, ListenerOptions, MySqlConnectionManager, PositionProvider, ReplicationSource,
};
use dbscript_shared::DbscriptConfig;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What the consumers saw during one [`run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Change event consumer outcome counts
    pub events: ConsumerStats,
    /// Save-points the sink stored
    pub savepoints_saved: u64,
}

/// Check the server can feed a listener and report where its binlog currently ends.
#[instrument(skip(config), fields(address = %config.source.address()))]
pub async fn preflight(config: &DbscriptConfig) -> Result<BinlogPosition> {
    let options = ListenerOptions::from_config(config).connect_options();
    let manager = MySqlConnectionManager::new(options, 1).await?;
    manager.test_connection().await?;
    manager.verify_replication_prerequisites().await?;
    manager.current_position().await
}

/// Run a listener built from configuration. See [`run`].
pub async fn run_with_config<S>(
    config: &DbscriptConfig,
    source: S,
    handler: Arc<dyn ChangeEventHandler>,
    sink: Arc<dyn SavePointSink>,
) -> Result<RunSummary>
where
    S: ReplicationSource + 'static,
{
    run(ListenerOptions::from_config(config), source, handler, sink).await
}

/// Listen until the stream ends, a fatal error occurs, or the process receives
/// SIGINT/SIGTERM/SIGQUIT.
///
/// Both consumers are drained before returning. A fatal listener error is
/// returned after draining; restarting from the last save-point is up to the
/// supervisor.
#[instrument(skip_all, fields(schema = %options.filter.schema))]
pub async fn run<S>(
    options: ListenerOptions,
    source: S,
    handler: Arc<dyn ChangeEventHandler>,
    sink: Arc<dyn SavePointSink>,
) -> Result<RunSummary>
where
    S: ReplicationSource + 'static,
{
    let mut listener = BinlogListener::new(options, source).await?;
    let handle = listener.handle();

    let events = listener
        .take_event_stream()
        .ok_or_else(|| DbscriptError::Internal("event stream already taken".into()))?;
    let savepoints = listener
        .take_savepoint_stream()
        .ok_or_else(|| DbscriptError::Internal("save point stream already taken".into()))?;

    let event_task = tokio::spawn(run_event_consumer(events, handler));
    let savepoint_task = tokio::spawn(run_savepoint_consumer(savepoints, sink));

    let listen = listener.listen();
    tokio::pin!(listen);

    let result = tokio::select! {
        result = &mut listen => result,
        _ = shutdown_signal() => {
            handle.close();
            listen.await
        }
    };

    let events = event_task
        .await
        .map_err(|e| DbscriptError::Internal(format!("event consumer panicked: {e}")))?;
    let savepoints_saved = savepoint_task
        .await
        .map_err(|e| DbscriptError::Internal(format!("save point consumer panicked: {e}")))?;

    info!(
        batches = events.batches,
        events = events.events,
        savepoints = savepoints_saved,
        position = %handle.position(),
        "dbscript stopped"
    );

    result.map(|()| RunSummary {
        events,
        savepoints_saved,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(mut sigterm), Ok(mut sigquit)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigquit.recv() => {}
                }
            }
            _ => {
                warn!("Failed to install SIGTERM/SIGQUIT handlers");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
