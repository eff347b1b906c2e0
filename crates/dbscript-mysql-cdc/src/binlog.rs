//! Binlog position tracking

use crate::PositionProvider;
use dbscript_core::{BinlogPosition, Result, SavePoint};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Read handle on the current position. Written only by the listener.
#[derive(Debug, Clone)]
pub struct SharedPosition(Arc<RwLock<BinlogPosition>>);

impl SharedPosition {
    fn new(position: BinlogPosition) -> Self {
        Self(Arc::new(RwLock::new(position)))
    }

    pub fn get(&self) -> BinlogPosition {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, position: BinlogPosition) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = position;
    }
}

/// Tracks the resumable stream position and decides when to emit save-points.
///
/// Rotation and schema change boundaries always produce a forced save-point.
/// Commits only advance the in-memory position, unless a flush interval is
/// configured and has elapsed since the last save-point.
#[derive(Debug)]
pub struct PositionTracker {
    current: SharedPosition,
    flush_interval: Option<Duration>,
    last_save: Instant,
}

impl PositionTracker {
    pub fn new(initial: BinlogPosition) -> Self {
        Self {
            current: SharedPosition::new(initial),
            flush_interval: None,
            last_save: Instant::now(),
        }
    }

    /// Start from `start` if given, otherwise from the source's current end of log.
    pub async fn resolve<P>(provider: &P, start: Option<BinlogPosition>) -> Result<Self>
    where
        P: PositionProvider + ?Sized,
    {
        let initial = match start {
            Some(position) => {
                info!(position = %position, "Resuming from configured position");
                position
            }
            None => {
                let position = provider.current_position().await?;
                info!(position = %position, "Starting from current end of binlog");
                position
            }
        };

        Ok(Self::new(initial))
    }

    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn current(&self) -> BinlogPosition {
        self.current.get()
    }

    pub fn handle(&self) -> SharedPosition {
        self.current.clone()
    }

    /// The log moved to a new file.
    pub fn on_rotate(&mut self, next: BinlogPosition) -> SavePoint {
        debug!(position = %next, "Binlog rotated");
        self.save(next, true)
    }

    /// A schema altering statement was applied.
    pub fn on_schema_change(&mut self, position: BinlogPosition) -> SavePoint {
        debug!(position = %position, "Schema changed");
        self.save(position, true)
    }

    /// A transaction committed.
    pub fn on_commit(&mut self, position: BinlogPosition) -> Option<SavePoint> {
        match self.flush_interval {
            Some(interval) if self.last_save.elapsed() >= interval => {
                Some(self.save(position, false))
            }
            _ => {
                self.current.set(position);
                None
            }
        }
    }

    fn save(&mut self, position: BinlogPosition, force: bool) -> SavePoint {
        self.current.set(position.clone());
        self.last_save = Instant::now();
        SavePoint::new(position, force)
    }
}
