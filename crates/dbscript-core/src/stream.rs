//! Bounded, ordered delivery queues with cooperative cancellation.
//!
//! The listener is the only producer. Every queue has exactly one consumer,
//! which drains items in enqueue order. A full queue blocks the producer; once
//! the shared [`CancellationToken`] fires, pushes fail fast with
//! [`DbscriptError::Cancelled`] instead of waiting on a consumer that may never
//! come back. Dropping the producer side closes the queue, so consumers drain
//! what is buffered and then observe the end of the stream. A consumer that
//! goes away without a shutdown makes pushes fail with
//! [`DbscriptError::QueueClosed`].

use crate::{ChangeBatch, DbscriptError, Result, SavePoint};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer half of a bounded queue
#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

impl<T: Send> QueueSender<T> {
    /// Enqueue an item, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DbscriptError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(queue = self.name, "push interrupted by cancellation");
                Err(DbscriptError::Cancelled)
            }
            sent = self.tx.send(item) => {
                sent.map_err(|_| DbscriptError::QueueClosed(self.name))
            }
        }
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Consumer half of a bounded queue
#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Next item in enqueue order; `None` once the producer is gone and the
    /// buffer is drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}

/// Create a named bounded queue tied to a cancellation token.
pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<(QueueSender<T>, QueueReceiver<T>)> {
    if capacity == 0 {
        return Err(DbscriptError::Config(format!(
            "{name} queue capacity must be greater than zero"
        )));
    }

    let (tx, rx) = mpsc::channel(capacity);
    Ok((QueueSender { name, tx, cancel }, QueueReceiver { name, rx }))
}

/// Consumer ends of a [`StreamPipeline`]
#[derive(Debug)]
pub struct PipelineReceivers {
    pub events: QueueReceiver<ChangeBatch>,
    pub savepoints: QueueReceiver<SavePoint>,
}

/// The change event queue and the save-point queue, sharing one cancellation signal
#[derive(Debug)]
pub struct StreamPipeline {
    events: QueueSender<ChangeBatch>,
    savepoints: QueueSender<SavePoint>,
    cancel: CancellationToken,
}

impl StreamPipeline {
    pub fn new(
        event_capacity: usize,
        savepoint_capacity: usize,
    ) -> Result<(Self, PipelineReceivers)> {
        Self::with_token(event_capacity, savepoint_capacity, CancellationToken::new())
    }

    pub fn with_token(
        event_capacity: usize,
        savepoint_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<(Self, PipelineReceivers)> {
        let (events_tx, events_rx) = bounded("events", event_capacity, cancel.clone())?;
        let (savepoints_tx, savepoints_rx) =
            bounded("savepoints", savepoint_capacity, cancel.clone())?;

        Ok((
            Self {
                events: events_tx,
                savepoints: savepoints_tx,
                cancel,
            },
            PipelineReceivers {
                events: events_rx,
                savepoints: savepoints_rx,
            },
        ))
    }

    pub async fn push_events(&self, batch: ChangeBatch) -> Result<()> {
        self.events.push(batch).await
    }

    pub async fn push_savepoint(&self, savepoint: SavePoint) -> Result<()> {
        self.savepoints.push(savepoint).await
    }

    /// Set the cancellation signal. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &QueueSender<ChangeBatch> {
        &self.events
    }

    pub fn savepoints(&self) -> &QueueSender<SavePoint> {
        &self.savepoints
    }
}
