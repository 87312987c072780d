//! Aggregate model module
//!
//! The contract between the engine and domain aggregates. The engine never
//! interprets domain state; it persists events, snapshots serialized state,
//! and replays history back through this interface.

pub mod event;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use event::{EventRow, HistoryEvent, ModelView, PendingEvent, SnapshotRow, WireEvent};

use crate::store::StoreError;

/// Snapshot retention policy declared by an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRetention {
    /// Minimum number of most recent snapshots always kept
    pub min_keep: u32,
    /// Protected window of block heights below the current height (0 disables)
    pub keep_window: u64,
}

impl Default for SnapshotRetention {
    fn default() -> Self {
        Self {
            min_keep: 2,
            keep_window: 0,
        }
    }
}

/// Aggregate root contract
///
/// An aggregate is identified by its `aggregate_id`, which doubles as the
/// name of its event table. State is derived from events, never directly
/// mutated by the engine.
pub trait AggregateRoot: Send {
    /// Aggregate identifier; also the event table name
    fn aggregate_id(&self) -> &str;

    /// Current version (number of events ever produced, including unsaved)
    fn version(&self) -> i64;

    /// Highest block height applied to this aggregate, if any
    fn last_block_height(&self) -> Option<i64>;

    /// Whether snapshot retention may prune this aggregate's old snapshots
    fn allow_pruning(&self) -> bool {
        false
    }

    /// Events produced since the last successful save
    fn unsaved_events(&self) -> &[PendingEvent];

    /// Mark all unsaved events as durably persisted
    fn mark_events_saved(&mut self);

    /// Apply a batch of historical events in version order
    fn load_from_history(&mut self, batch: Vec<HistoryEvent>) -> Result<(), StoreError>;

    /// Serialize current state as a JSON string
    fn to_snapshot(&self) -> Result<String, StoreError>;

    /// Replace current state from a stored snapshot
    fn restore_from_snapshot(&mut self, snapshot: &SnapshotRow) -> Result<(), StoreError>;

    /// Whether the aggregate currently wants a snapshot taken
    fn can_make_snapshot(&self) -> bool {
        false
    }

    /// Retention policy for this aggregate's snapshots
    fn snapshot_retention(&self) -> SnapshotRetention {
        SnapshotRetention::default()
    }

    /// Reset the aggregate's snapshot eligibility counter
    fn reset_snapshot_counter(&mut self) {}
}

/// Shared handle to an aggregate
///
/// The read cache is the sole owner of live aggregates; the write path reads
/// a handle out, mutates the aggregate in place under its lock, and puts the
/// handle back.
pub type SharedModel = Arc<Mutex<Box<dyn AggregateRoot>>>;

/// Wrap an aggregate into a shared handle
pub fn shared<A: AggregateRoot + 'static>(model: A) -> SharedModel {
    Arc::new(Mutex::new(Box::new(model)))
}
