//! Storage module
//!
//! One storage contract, three backends. The adapter owns transactions,
//! payload layout, outbox ordering, and the local delivery watermark; the
//! write and read services never touch SQL themselves.

mod error;
pub mod outbox;
pub(crate) mod registry;

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::{DurableMedium, FileMedium, MemoryStore};
pub use outbox::{
    plan_chunk, prefetch_limit, OutboxRow, PrefetchBounds, AVG_EVENT_BYTES_GUESS,
    EMBEDDED_PREFETCH, FIXED_EVENT_OVERHEAD_BYTES, SERVER_PREFETCH,
};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::model::{
    AggregateRoot, EventRow, ModelView, SharedModel, SnapshotRetention, SnapshotRow, WireEvent,
};

/// Upper bound on bind parameters per statement for the embedded and
/// in-memory stores
pub const EMBEDDED_MAX_BIND_PARAMS: usize = 900;

/// Upper bound on bind parameters per statement for the server store
pub const SERVER_MAX_BIND_PARAMS: usize = 50_000;

/// Default replay batch size
pub const DEFAULT_REPLAY_BATCH_SIZE: i64 = 5000;

/// Options for replaying events into an aggregate
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Only apply events with `block_height` present and at most this value
    pub block_height: Option<i64>,
    /// Resume after this version (exclusive)
    pub last_version: i64,
    /// Rows fetched per round-trip
    pub batch_size: i64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            block_height: None,
            last_version: 0,
            batch_size: DEFAULT_REPLAY_BATCH_SIZE,
        }
    }
}

/// Sort key for read-side event queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Version,
    CreatedAt,
}

/// Sort direction for read-side event queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDir {
    #[default]
    Asc,
    Desc,
}

/// Filter for read-side event range queries
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub version_gte: Option<i64>,
    pub version_lte: Option<i64>,
    pub height_gte: Option<i64>,
    pub height_lte: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order_by: OrderBy,
    pub order_dir: OrderDir,
}

/// Result of one `persist_aggregates_and_outbox` call
#[derive(Debug, Default)]
pub struct PersistOutcome {
    /// Outbox ids inserted by this call, in insertion order
    pub inserted_outbox_ids: Vec<i64>,
    /// Microsecond timestamp backing the first inserted outbox id
    pub first_ts: i64,
    /// First inserted outbox id
    pub first_id: i64,
    /// Microsecond timestamp backing the last inserted outbox id
    pub last_ts: i64,
    /// Last inserted outbox id
    pub last_id: i64,
    /// Delivery-ready view of the rows inserted by this call
    pub raw_events: Vec<WireEvent>,
}

/// Transport publisher collaborator.
///
/// One call delivers one batch; the returned future resolves only after the
/// transport has acknowledged the whole batch.
#[async_trait]
pub trait BatchPublisher: Send + Sync {
    async fn publish_batch_with_ack(&self, batch: Vec<WireEvent>) -> StoreResult<()>;
}

/// The backend-portable storage contract.
///
/// Every implementation serializes writers through a process-local write
/// lock and drains through a delivery lock, owns the outbox watermark, and
/// finalizes every transaction with a commit or a rollback.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Create missing tables, indexes and integrity guards for the given
    /// aggregates plus the global outbox and snapshot tables. Idempotent.
    async fn ensure_schema(&self, aggregate_ids: &[&str]) -> StoreResult<()>;

    /// Persist all unsaved events of the given aggregates and enqueue them
    /// into the outbox in one transaction.
    ///
    /// Unique conflicts on `(version, request_id)` or
    /// `(aggregate_id, event_version)` are swallowed; all other errors roll
    /// the transaction back and propagate. On success the aggregates'
    /// events are marked saved.
    async fn persist_aggregates_and_outbox(
        &self,
        models: &[SharedModel],
    ) -> StoreResult<PersistOutcome>;

    /// Delete outbox rows by id, chunked under the backend parameter limit
    async fn delete_outbox_by_ids(&self, ids: &[i64]) -> StoreResult<()>;

    /// Whether any outbox row precedes the given id
    async fn has_backlog_before(&self, ts_micros: i64, id: i64) -> StoreResult<bool>;

    /// Whether any outbox row sits above the local delivery watermark
    async fn has_pending_after_watermark(&self) -> StoreResult<bool>;

    /// Drain one byte-budgeted chunk in id order: prefetch, deliver,
    /// ACK-delete, advance the watermark. Returns the number of events
    /// delivered; 0 means the outbox is drained.
    ///
    /// On delivery failure the watermark does not move and the rows stay
    /// pending, preserving at-least-once delivery.
    async fn fetch_deliver_ack_chunk(
        &self,
        transport_cap_bytes: u64,
        publisher: &dyn BatchPublisher,
    ) -> StoreResult<usize>;

    /// Remove all state above the pivot height for the given aggregates:
    /// tail events, stale snapshots, and outbox rows per the backend's
    /// policy. Resets the delivery watermark to 0.
    async fn rollback_aggregates(
        &self,
        aggregate_ids: &[&str],
        block_height: i64,
    ) -> StoreResult<()>;

    /// Replay persisted events into an aggregate in version order, batched
    async fn apply_events_to_aggregate(
        &self,
        model: &mut dyn AggregateRoot,
        options: ReplayOptions,
    ) -> StoreResult<()>;

    /// Persist a snapshot of the aggregate's current state and reset its
    /// snapshot counter. A snapshot already present at the same
    /// `(aggregate_id, block_height)` is a no-op. Invokes retention pruning
    /// when the aggregate opts in.
    async fn create_snapshot(
        &self,
        model: &mut dyn AggregateRoot,
        retention: SnapshotRetention,
    ) -> StoreResult<()>;

    /// Latest snapshot for an aggregate, by block height
    async fn find_latest_snapshot(&self, aggregate_id: &str) -> StoreResult<Option<SnapshotRow>>;

    /// Latest snapshot at or below the given height
    async fn find_latest_snapshot_before_height(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<Option<SnapshotRow>>;

    /// Rebuild an aggregate to its exact state at the given height:
    /// nearest snapshot at or below the height, then trailing events
    async fn restore_exact_state_at_height(
        &self,
        model: &mut dyn AggregateRoot,
        block_height: i64,
    ) -> StoreResult<()>;

    /// Rebuild an aggregate to its latest state
    async fn restore_exact_state_latest(&self, model: &mut dyn AggregateRoot) -> StoreResult<()>;

    /// Apply the retention policy to an aggregate's snapshots
    async fn prune_old_snapshots(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()>;

    /// Delete events finalized strictly below the given height
    async fn prune_events_below(&self, aggregate_id: &str, block_height: i64) -> StoreResult<()>;

    /// Filtered event range for one aggregate; payloads stay JSON strings
    async fn fetch_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<EventRow>>;

    /// Filtered event ranges for several aggregates
    async fn fetch_events_for_many(
        &self,
        aggregate_ids: &[&str],
        filter: &EventFilter,
    ) -> StoreResult<Vec<(String, Vec<EventRow>)>> {
        let mut out = Vec::with_capacity(aggregate_ids.len());
        for id in aggregate_ids {
            out.push(((*id).to_string(), self.fetch_events_for_one(id, filter).await?));
        }
        Ok(out)
    }

    /// Stream a filtered event range in version order. Only the server
    /// store implements this; other backends signal `Unsupported`.
    async fn stream_events_for_one(
        &self,
        _aggregate_id: &str,
        _filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<EventRow>>> {
        Err(StoreError::Unsupported("streaming event reads"))
    }

    /// Stream filtered event ranges for several aggregates, one aggregate
    /// after another, each row tagged with its aggregate id. Server store
    /// only.
    async fn stream_events_for_many(
        &self,
        _aggregate_ids: &[&str],
        _filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<(String, EventRow)>>> {
        Err(StoreError::Unsupported("streaming event reads"))
    }

    /// Rehydrate the model at a height and return a lightweight view
    async fn get_one_model_by_height_read(
        &self,
        model: &mut dyn AggregateRoot,
        block_height: i64,
    ) -> StoreResult<ModelView> {
        self.restore_exact_state_at_height(model, block_height).await?;
        Ok(ModelView {
            aggregate_id: model.aggregate_id().to_string(),
            version: model.version(),
            block_height: model
                .last_block_height()
                .unwrap_or(crate::model::event::NO_BLOCK_HEIGHT),
            payload: model.to_snapshot()?,
        })
    }

    /// Rehydrate several models at a height and return their views
    async fn get_many_models_by_height_read(
        &self,
        models: &[SharedModel],
        block_height: i64,
    ) -> StoreResult<Vec<ModelView>> {
        let mut views = Vec::with_capacity(models.len());
        for model in models {
            let mut guard = model.lock().await;
            views.push(
                self.get_one_model_by_height_read(guard.as_mut(), block_height)
                    .await?,
            );
        }
        Ok(views)
    }

    /// Current delivery watermark (highest locally ACKed outbox id)
    async fn outbox_watermark(&self) -> i64;

    /// Number of rows currently pending in the outbox
    async fn outbox_pending_count(&self) -> StoreResult<i64>;
}
