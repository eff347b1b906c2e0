//! Binlog listener lifecycle.
//!
//! `Created -> Listening -> Closing -> Closed`, no way back. Only a listening
//! listener translates and enqueues. Entering `Closing` (an explicit close or a
//! fatal error) is the single place the cancellation signal is set; the queues
//! are closed for writing right after, so consumers drain what is buffered and
//! then see the end of their stream.

use crate::{
    ListenerOptions, Notification, PositionTracker, ReplicationSource, SharedPosition,
};
use dbscript_core::{
    BinlogPosition, CancellationToken, ChangeBatch, DbscriptError, EventTranslator,
    PipelineReceivers, QueueReceiver, Result, RowsEvent, SavePoint, StreamPipeline,
};
use dbscript_shared::{EventMetrics, PerfTimer};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Created = 0,
    Listening = 1,
    Closing = 2,
    Closed = 3,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Created => "created",
            ListenerState::Listening => "listening",
            ListenerState::Closing => "closing",
            ListenerState::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ListenerState::Created,
            1 => ListenerState::Listening,
            2 => ListenerState::Closing,
            _ => ListenerState::Closed,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between the listener and its handles
#[derive(Debug)]
struct Lifecycle {
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ListenerState::Created as u8),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ListenerState, to: ListenerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closing` and raise the cancellation signal. False if already closing or closed.
    fn begin_closing(&self) -> bool {
        loop {
            let current = self.state();
            if matches!(current, ListenerState::Closing | ListenerState::Closed) {
                return false;
            }
            if self.transition(current, ListenerState::Closing) {
                self.cancel.cancel();
                return true;
            }
        }
    }

    fn finish_closing(&self) {
        self.state.store(ListenerState::Closed as u8, Ordering::Release);
    }
}

/// Cloneable handle for observing and closing a listener from other tasks
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    lifecycle: Arc<Lifecycle>,
    position: SharedPosition,
}

impl ListenerHandle {
    /// Request shutdown. A running `listen` returns once the in-flight
    /// notification has been handled.
    pub fn close(&self) {
        if self.lifecycle.begin_closing() {
            info!("Close requested");
        }
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.state()
    }

    pub fn position(&self) -> BinlogPosition {
        self.position.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.lifecycle.cancel.clone()
    }
}

/// Drives one replication session into the change event and save-point queues
pub struct BinlogListener<S> {
    options: ListenerOptions,
    source: S,
    translator: EventTranslator,
    tracker: PositionTracker,
    pipeline: Option<StreamPipeline>,
    events: Option<QueueReceiver<ChangeBatch>>,
    savepoints: Option<QueueReceiver<SavePoint>>,
    lifecycle: Arc<Lifecycle>,
}

impl<S: ReplicationSource> BinlogListener<S> {
    /// Resolve the starting position and allocate the queues.
    #[instrument(skip(source), fields(schema = %options.filter.schema))]
    pub async fn new(options: ListenerOptions, source: S) -> Result<Self> {
        let tracker = PositionTracker::resolve(&source, options.start_position.clone())
            .await?
            .with_flush_interval(options.flush_interval);

        let lifecycle = Arc::new(Lifecycle::new());
        let (pipeline, PipelineReceivers { events, savepoints }) = StreamPipeline::with_token(
            options.event_queue_capacity,
            options.savepoint_queue_capacity,
            lifecycle.cancel.clone(),
        )?;

        let translator =
            EventTranslator::new().with_strict_primary_key(options.strict_primary_key);

        info!(
            address = %options.address(),
            user = %options.user,
            tables = %options.filter.tables.join(","),
            handler = %options.handler,
            position = %tracker.current(),
            "Binlog listener created"
        );

        Ok(Self {
            options,
            source,
            translator,
            tracker,
            pipeline: Some(pipeline),
            events: Some(events),
            savepoints: Some(savepoints),
            lifecycle,
        })
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            lifecycle: self.lifecycle.clone(),
            position: self.tracker.handle(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.state()
    }

    pub fn position(&self) -> BinlogPosition {
        self.tracker.current()
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    /// Consumer end of the change event queue. Available once.
    pub fn take_event_stream(&mut self) -> Option<QueueReceiver<ChangeBatch>> {
        self.events.take()
    }

    /// Consumer end of the save-point queue. Available once.
    pub fn take_savepoint_stream(&mut self) -> Option<QueueReceiver<SavePoint>> {
        self.savepoints.take()
    }

    /// Replicate until the stream ends, the listener is closed, or a fatal
    /// error occurs. The listener is closed when this returns.
    #[instrument(skip(self), fields(schema = %self.options.filter.schema))]
    pub async fn listen(&mut self) -> Result<()> {
        if !self
            .lifecycle
            .transition(ListenerState::Created, ListenerState::Listening)
        {
            return Err(DbscriptError::InvalidState {
                expected: ListenerState::Created.as_str(),
                actual: self.state().as_str(),
            });
        }

        let from = self.tracker.current();
        info!(position = %from, "Listening");

        let result = match self.source.start(&from, &self.options).await {
            Ok(()) => self.run().await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(error = %e, "Fatal error, closing listener");
            EventMetrics::fatal_error(error_kind(e));
        }

        self.shutdown().await;
        result
    }

    /// Close the listener if `listen` is not running it down already.
    pub async fn close(&mut self) {
        if self.state() != ListenerState::Closed {
            self.shutdown().await;
        }
    }

    async fn run(&mut self) -> Result<()> {
        let cancel = self.lifecycle.cancel.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = self.source.next_notification() => next?,
            };

            let Some(notification) = next else {
                info!("Replication stream ended");
                return Ok(());
            };

            match self.dispatch(notification).await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {
                    debug!("Dispatch interrupted by shutdown");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&mut self, notification: Notification) -> Result<()> {
        trace!(kind = notification.kind(), "Notification");

        match notification {
            Notification::RowChange(rows) => self.on_rows(rows).await,
            Notification::Rotate { next } => {
                let savepoint = self.tracker.on_rotate(next);
                self.emit_savepoint(savepoint).await
            }
            Notification::SchemaChange { position, query } => {
                debug!(query = ?query, "Schema change statement");
                let savepoint = self.tracker.on_schema_change(position);
                self.emit_savepoint(savepoint).await
            }
            Notification::TransactionBoundary { position } => {
                match self.tracker.on_commit(position) {
                    Some(savepoint) => self.emit_savepoint(savepoint).await,
                    None => Ok(()),
                }
            }
            Notification::TableChanged { schema, table } => {
                debug!(schema = %schema, table = %table, "Table metadata changed");
                Ok(())
            }
        }
    }

    async fn on_rows(&self, rows: RowsEvent) -> Result<()> {
        let table = &rows.table;
        if !self.options.filter.matches(&table.schema, &table.name) {
            trace!(schema = %table.schema, table = %table.name, "Skipping filtered table");
            return Ok(());
        }

        let batch = {
            let _timer = PerfTimer::new("dbscript_translate_duration_seconds")
                .with_label("table", table.name.clone());
            self.translator.translate(&rows).map_err(|e| {
                error!(action = %rows.action, table = %table.name, error = %e, "Translation failed");
                e
            })?
        };

        if batch.is_empty() {
            return Ok(());
        }

        if let Some(first) = batch.first() {
            EventMetrics::events_translated(
                &first.database,
                &first.table,
                first.change_type.as_str(),
                batch.len(),
            );
        }

        let pipeline = self.pipeline.as_ref().ok_or(DbscriptError::Cancelled)?;
        let len = batch.len();
        pipeline.push_events(batch).await?;
        EventMetrics::batch_enqueued(len);
        EventMetrics::queue_size(pipeline.events().len(), "events");
        Ok(())
    }

    async fn emit_savepoint(&self, savepoint: SavePoint) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(DbscriptError::Cancelled)?;
        let force = savepoint.force;
        debug!(position = %savepoint.position, force, "Emitting save point");
        pipeline.push_savepoint(savepoint).await?;
        EventMetrics::savepoint_emitted(force);
        EventMetrics::queue_size(pipeline.savepoints().len(), "savepoints");
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.lifecycle.begin_closing();

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close replication source");
        }

        self.pipeline.take();
        self.lifecycle.finish_closing();
        info!(position = %self.tracker.current(), "Listener closed");
    }
}

fn error_kind(err: &DbscriptError) -> &'static str {
    match err {
        DbscriptError::MissingPairedRow { .. } => "missing_paired_row",
        DbscriptError::UnsupportedOperation(_) => "unsupported_operation",
        DbscriptError::RowShorterThanPrimaryKey { .. } => "row_shorter_than_primary_key",
        DbscriptError::Upstream(_) => "upstream",
        DbscriptError::QueueClosed(_) => "queue_closed",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PositionProvider;
    use async_trait::async_trait;
    use dbscript_core::{ChangeType, ColumnType, EventHeader, RowAction, TableSchemaSnapshot};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct SourceLog {
        started_from: Mutex<Option<BinlogPosition>>,
        patterns: Mutex<Vec<String>>,
        server_id: Mutex<Option<u32>>,
        closed: AtomicBool,
    }

    struct ScriptedSource {
        script: VecDeque<Result<Notification>>,
        hang_when_drained: bool,
        seen: Arc<SourceLog>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Notification>>) -> (Self, Arc<SourceLog>) {
            let seen = Arc::new(SourceLog::default());
            (
                Self {
                    script: script.into(),
                    hang_when_drained: false,
                    seen: seen.clone(),
                },
                seen,
            )
        }

        fn hanging(mut self) -> Self {
            self.hang_when_drained = true;
            self
        }
    }

    #[async_trait]
    impl PositionProvider for ScriptedSource {
        async fn current_position(&self) -> Result<BinlogPosition> {
            Ok(BinlogPosition::new("mysql-bin.000001", 4))
        }
    }

    #[async_trait]
    impl ReplicationSource for ScriptedSource {
        async fn start(&mut self, from: &BinlogPosition, options: &ListenerOptions) -> Result<()> {
            *self.seen.started_from.lock().unwrap() = Some(from.clone());
            *self.seen.patterns.lock().unwrap() = options.filter.include_patterns();
            *self.seen.server_id.lock().unwrap() = Some(options.server_id);
            Ok(())
        }

        async fn next_notification(&mut self) -> Result<Option<Notification>> {
            match self.script.pop_front() {
                Some(next) => next.map(Some),
                None if self.hang_when_drained => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.seen.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn users() -> Arc<TableSchemaSnapshot> {
        Arc::new(
            TableSchemaSnapshot::new("test_db", "users")
                .with_column("id", ColumnType::Number)
                .with_column("name", ColumnType::String)
                .with_primary_key(0),
        )
    }

    fn rows(action: RowAction, rows: Vec<Vec<Value>>) -> Result<Notification> {
        Ok(Notification::RowChange(RowsEvent::new(
            users(),
            action,
            rows,
            EventHeader::new(1234567890, 1, 1000),
        )))
    }

    fn options() -> ListenerOptions {
        ListenerOptions::new("test_db").include_table("users")
    }

    #[tokio::test]
    async fn test_listen_delivers_batches_and_savepoints() {
        let (source, seen) = ScriptedSource::new(vec![
            rows(RowAction::Insert, vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]]),
            Ok(Notification::TransactionBoundary {
                position: BinlogPosition::new("mysql-bin.000001", 300),
            }),
            rows(
                RowAction::Update,
                vec![vec![json!(1), json!("a")], vec![json!(1), json!("c")]],
            ),
            Ok(Notification::Rotate {
                next: BinlogPosition::new("mysql-bin.000002", 4),
            }),
            Ok(Notification::TableChanged {
                schema: "test_db".into(),
                table: "users".into(),
            }),
            rows(RowAction::Delete, vec![vec![json!(2), json!("b")]]),
            Ok(Notification::SchemaChange {
                position: BinlogPosition::new("mysql-bin.000002", 900),
                query: Some("ALTER TABLE users ADD COLUMN age INT".into()),
            }),
        ]);

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        assert_eq!(listener.state(), ListenerState::Created);
        let mut events = listener.take_event_stream().unwrap();
        let mut savepoints = listener.take_savepoint_stream().unwrap();
        assert!(listener.take_event_stream().is_none());

        listener.listen().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(seen.closed.load(Ordering::SeqCst));
        assert_eq!(
            *seen.started_from.lock().unwrap(),
            Some(BinlogPosition::new("mysql-bin.000001", 4))
        );
        assert_eq!(*seen.patterns.lock().unwrap(), vec!["test_db\\.users"]);
        assert_eq!(*seen.server_id.lock().unwrap(), Some(1001));

        let inserts = events.pop().await.unwrap();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].change_type, ChangeType::Insert);
        assert_eq!(inserts[1].primary_key, vec![json!(2)]);

        let updates = events.pop().await.unwrap();
        assert_eq!(updates[0].change_type, ChangeType::Update);
        assert_eq!(
            updates[0].after.as_ref().unwrap().get("name"),
            Some(&json!("c"))
        );

        let deletes = events.pop().await.unwrap();
        assert_eq!(deletes[0].change_type, ChangeType::Delete);
        assert!(events.pop().await.is_none());

        let rotate = savepoints.pop().await.unwrap();
        assert!(rotate.force);
        assert_eq!(rotate.position, BinlogPosition::new("mysql-bin.000002", 4));
        let ddl = savepoints.pop().await.unwrap();
        assert!(ddl.force);
        assert_eq!(ddl.position.position, 900);
        assert!(savepoints.pop().await.is_none());

        assert_eq!(listener.position(), BinlogPosition::new("mysql-bin.000002", 900));
    }

    #[tokio::test]
    async fn test_odd_update_is_fatal() {
        let (source, seen) = ScriptedSource::new(vec![
            rows(RowAction::Insert, vec![vec![json!(1), json!("a")]]),
            rows(RowAction::Update, vec![vec![json!(1), json!("a")]]),
            rows(RowAction::Insert, vec![vec![json!(2), json!("b")]]),
        ]);

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let handle = listener.handle();
        let mut events = listener.take_event_stream().unwrap();

        let result = listener.listen().await;
        assert!(matches!(result, Err(DbscriptError::MissingPairedRow { .. })));
        assert_eq!(handle.state(), ListenerState::Closed);
        assert!(handle.is_cancelled());
        assert!(seen.closed.load(Ordering::SeqCst));

        // Enqueued before the failure, still drainable; nothing after it.
        assert_eq!(events.pop().await.unwrap()[0].primary_key, vec![json!(1)]);
        assert!(events.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_action_is_fatal() {
        let (source, _seen) = ScriptedSource::new(vec![rows(
            RowAction::Other("truncate".into()),
            vec![vec![json!(1)]],
        )]);

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let result = listener.listen().await;
        assert!(matches!(result, Err(DbscriptError::UnsupportedOperation(_))));
        assert_eq!(listener.state(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through() {
        let (source, seen) = ScriptedSource::new(vec![Err(DbscriptError::upstream(
            "connection reset by peer",
        ))]);

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let err = listener.listen().await.unwrap_err();
        assert!(matches!(err, DbscriptError::Upstream(_)));
        assert!(err.to_string().contains("connection reset by peer"));
        assert!(seen.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_from_handle_stops_idle_listener() {
        let (source, seen) = ScriptedSource::new(Vec::new());
        let mut listener = BinlogListener::new(options(), source.hanging())
            .await
            .unwrap();
        let handle = listener.handle();

        let task = tokio::spawn(async move {
            let result = listener.listen().await;
            (result, listener)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), ListenerState::Listening);
        handle.close();

        let (result, listener) = timeout(Duration::from_secs(1), task)
            .await
            .expect("listen should return after close")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(listener.state(), ListenerState::Closed);
        assert!(seen.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_releases_producer_blocked_on_full_queue() {
        let script = (0..4)
            .map(|i| rows(RowAction::Insert, vec![vec![json!(i), json!("x")]]))
            .collect();
        let (source, _seen) = ScriptedSource::new(script);

        let mut listener = BinlogListener::new(options().with_queue_capacity(1, 1), source)
            .await
            .unwrap();
        let handle = listener.handle();
        let mut events = listener.take_event_stream().unwrap();

        let task = tokio::spawn(async move { listener.listen().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished(), "producer should be blocked by the full queue");

        handle.close();
        let result = timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation must release the blocked push")
            .unwrap();
        assert!(result.is_ok());

        assert_eq!(events.pop().await.unwrap()[0].primary_key, vec![json!(0)]);
        assert!(events.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_lost_consumer_is_fatal() {
        let (source, seen) = ScriptedSource::new(
            (0..3)
                .map(|i| rows(RowAction::Insert, vec![vec![json!(i), json!("x")]]))
                .collect(),
        );

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let handle = listener.handle();
        drop(listener.take_event_stream());

        let err = listener.listen().await.unwrap_err();
        assert!(matches!(err, DbscriptError::QueueClosed("events")));
        assert_eq!(handle.state(), ListenerState::Closed);
        assert!(seen.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_listen_twice_is_rejected() {
        let (source, _seen) = ScriptedSource::new(Vec::new());
        let mut listener = BinlogListener::new(options(), source).await.unwrap();

        listener.listen().await.unwrap();
        let err = listener.listen().await.unwrap_err();
        assert!(matches!(
            err,
            DbscriptError::InvalidState {
                expected: "created",
                actual: "closed"
            }
        ));
    }

    #[tokio::test]
    async fn test_close_before_listen() {
        let (source, seen) = ScriptedSource::new(Vec::new());
        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let handle = listener.handle();

        handle.close();
        assert_eq!(handle.state(), ListenerState::Closing);
        assert!(listener.listen().await.is_err());

        listener.close().await;
        assert_eq!(handle.state(), ListenerState::Closed);
        assert!(seen.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_configured_start_position() {
        let (source, seen) = ScriptedSource::new(Vec::new());
        let start = BinlogPosition::new("mysql-bin.000009", 77);
        let mut listener =
            BinlogListener::new(options().with_start_position(start.clone()), source)
                .await
                .unwrap();

        listener.listen().await.unwrap();
        assert_eq!(*seen.started_from.lock().unwrap(), Some(start));
    }

    #[tokio::test]
    async fn test_filtered_tables_are_skipped() {
        let other = Arc::new(
            TableSchemaSnapshot::new("test_db", "sessions")
                .with_column("id", ColumnType::Number)
                .with_primary_key(0),
        );
        let (source, _seen) = ScriptedSource::new(vec![
            Ok(Notification::RowChange(RowsEvent::new(
                other,
                RowAction::Insert,
                vec![vec![json!(1)]],
                EventHeader::default(),
            ))),
            rows(RowAction::Insert, vec![vec![json!(5), json!("kept")]]),
        ]);

        let mut listener = BinlogListener::new(options(), source).await.unwrap();
        let mut events = listener.take_event_stream().unwrap();
        listener.listen().await.unwrap();

        let batch = events.pop().await.unwrap();
        assert_eq!(batch[0].table, "users");
        assert!(events.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_periodic_flush_on_commit() {
        let (source, _seen) = ScriptedSource::new(vec![Ok(Notification::TransactionBoundary {
            position: BinlogPosition::new("mysql-bin.000001", 640),
        })]);

        let mut listener =
            BinlogListener::new(options().with_flush_interval(Duration::ZERO), source)
                .await
                .unwrap();
        let mut savepoints = listener.take_savepoint_stream().unwrap();
        listener.listen().await.unwrap();

        let sp = savepoints.pop().await.unwrap();
        assert!(!sp.force);
        assert_eq!(sp.position.position, 640);
    }

    #[tokio::test]
    async fn test_zero_capacity_fails_construction() {
        let (source, _seen) = ScriptedSource::new(Vec::new());
        let result = BinlogListener::new(options().with_queue_capacity(0, 4), source).await;
        assert!(matches!(result, Err(DbscriptError::Config(_))));
    }
}
