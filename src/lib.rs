//! chainstore Library
//!
//! Event-sourced aggregate storage engine with a transactional outbox and
//! at-least-once delivery. Aggregates advance by block height; reorgs roll
//! state back to a pivot height across event tables, snapshots and the
//! outbox. One storage contract, three backends: PostgreSQL, embedded
//! SQLite, and an in-memory engine with explicit durable-image flushes.

pub mod config;
pub mod idgen;
pub mod model;
pub mod payload;
pub mod read;
pub mod store;
pub mod write;

pub use config::{ConfigError, EngineConfig};
pub use idgen::MonotonicId;
pub use model::{
    shared, AggregateRoot, EventRow, HistoryEvent, ModelView, PendingEvent, SharedModel,
    SnapshotRetention, SnapshotRow, WireEvent,
};
pub use read::{ModelCache, ReadService};
pub use store::{
    BatchPublisher, DurableMedium, EventFilter, FileMedium, MemoryStore, OrderBy, OrderDir,
    PersistOutcome, PostgresStore, ReplayOptions, SqliteStore, StorageAdapter, StoreError,
    StoreResult,
};
pub use write::WriteService;
