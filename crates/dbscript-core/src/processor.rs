//! Downstream consumers of the change event and save-point queues

use crate::{ChangeEvent, QueueReceiver, Result, SavePoint};
use async_trait::async_trait;
use dbscript_shared::EventMetrics;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Result of handing one batch to a [`ChangeEventHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Accepted,
    Dropped { reason: String },
    Errored { message: String },
}

impl HandlerOutcome {
    pub fn dropped(reason: impl Into<String>) -> Self {
        HandlerOutcome::Dropped {
            reason: reason.into(),
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        HandlerOutcome::Errored {
            message: message.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Accepted => "accepted",
            HandlerOutcome::Dropped { .. } => "dropped",
            HandlerOutcome::Errored { .. } => "errored",
        }
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutcome::Accepted => f.write_str("accepted"),
            HandlerOutcome::Dropped { reason } => write!(f, "dropped: {reason}"),
            HandlerOutcome::Errored { message } => write!(f, "errored: {message}"),
        }
    }
}

/// Scripting hook capability: process one change event batch.
#[async_trait]
pub trait ChangeEventHandler: Send + Sync {
    async fn handle_batch(&self, batch: &[ChangeEvent]) -> HandlerOutcome;

    /// Identity used in logs and metrics
    fn name(&self) -> &str {
        "handler"
    }
}

/// Position persistence capability: store one save-point.
#[async_trait]
pub trait SavePointSink: Send + Sync {
    async fn save(&self, savepoint: &SavePoint) -> Result<()>;
}

/// Accepts every batch and logs it
pub struct LoggingHandler;

#[async_trait]
impl ChangeEventHandler for LoggingHandler {
    async fn handle_batch(&self, batch: &[ChangeEvent]) -> HandlerOutcome {
        for event in batch {
            info!(
                database = %event.database,
                table = %event.table,
                change_type = %event.change_type,
                position = event.position,
                pk = ?event.primary_key,
                "Change event"
            );
        }
        HandlerOutcome::Accepted
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Logs save-points instead of persisting them
pub struct LoggingSavePointSink;

#[async_trait]
impl SavePointSink for LoggingSavePointSink {
    async fn save(&self, savepoint: &SavePoint) -> Result<()> {
        info!(
            position = %savepoint.position,
            force = savepoint.force,
            "Save point"
        );
        Ok(())
    }
}

/// Outcome counts of an event consumer run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: u64,
    pub events: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub errored: u64,
}

impl ConsumerStats {
    fn record(&mut self, events: usize, outcome: &HandlerOutcome) {
        self.batches += 1;
        self.events += events as u64;
        match outcome {
            HandlerOutcome::Accepted => self.accepted += 1,
            HandlerOutcome::Dropped { .. } => self.dropped += 1,
            HandlerOutcome::Errored { .. } => self.errored += 1,
        }
    }
}

/// Drain the change event queue into `handler` until the queue closes.
///
/// Outcomes are logged and counted; retry or dead-lettering belongs to the handler.
#[instrument(skip_all, fields(handler = handler.name()))]
pub async fn run_event_consumer(
    mut events: QueueReceiver<Vec<ChangeEvent>>,
    handler: Arc<dyn ChangeEventHandler>,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();

    while let Some(batch) = events.pop().await {
        let outcome = handler.handle_batch(&batch).await;
        EventMetrics::handler_outcome(handler.name(), outcome.as_str());

        match &outcome {
            HandlerOutcome::Accepted => debug!(events = batch.len(), "Batch accepted"),
            HandlerOutcome::Dropped { reason } => {
                info!(events = batch.len(), reason = %reason, "Batch dropped")
            }
            HandlerOutcome::Errored { message } => {
                error!(events = batch.len(), error = %message, "Batch handler failed")
            }
        }

        stats.record(batch.len(), &outcome);
    }

    info!(
        batches = stats.batches,
        events = stats.events,
        "Event queue closed, consumer stopping"
    );
    stats
}

/// Drain the save-point queue into `sink` until the queue closes.
///
/// A failed save is logged and skipped; the next save-point supersedes it.
/// Returns the number of save-points stored.
#[instrument(skip_all)]
pub async fn run_savepoint_consumer(
    mut savepoints: QueueReceiver<SavePoint>,
    sink: Arc<dyn SavePointSink>,
) -> u64 {
    let mut saved = 0;

    while let Some(savepoint) = savepoints.pop().await {
        match sink.save(&savepoint).await {
            Ok(()) => saved += 1,
            Err(e) => warn!(
                position = %savepoint.position,
                error = %e,
                "Failed to persist save point"
            ),
        }
    }

    info!(saved, "Save point queue closed, consumer stopping");
    saved
}
