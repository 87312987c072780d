//! Event carrier types
//!
//! The records that cross the engine's boundaries: events produced by
//! aggregates, history replayed into them, wire records handed to the
//! transport, and read-side row views.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Block height value used on the wire when a row has no height yet
pub const NO_BLOCK_HEIGHT: i64 = -1;

/// An event produced by an aggregate, not yet persisted
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Event class name
    pub event_type: String,
    /// Idempotency key, unique together with the event's version
    pub request_id: String,
    /// Block height; `None` while the event is not finalized
    pub block_height: Option<i64>,
    /// Event origin time, microseconds
    pub timestamp: i64,
    /// Event payload as a JSON string
    pub payload: String,
}

/// A persisted event replayed into an aggregate
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    /// Version of the event within its aggregate stream
    pub version: i64,
    /// Event class name
    pub event_type: String,
    /// Idempotency key
    pub request_id: String,
    /// Block height, if finalized
    pub block_height: Option<i64>,
    /// Event origin time, microseconds
    pub timestamp: i64,
    /// Event payload as a JSON string (decompressed)
    pub payload: String,
}

/// Delivery-ready record handed to the transport publisher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Aggregate id the event belongs to
    pub model_name: String,
    /// Event class name
    pub event_type: String,
    /// Version of the event within its aggregate stream
    pub event_version: i64,
    /// Idempotency key
    pub request_id: String,
    /// Block height, `-1` when absent
    pub block_height: i64,
    /// Payload as a JSON string (decompressed)
    pub payload: String,
    /// Event origin time, microseconds
    pub timestamp: i64,
}

/// Read-side event row; the payload is returned as a JSON string, unparsed
#[derive(Debug, Clone)]
pub struct EventRow {
    /// Storage row id
    pub id: i64,
    /// Version within the aggregate stream
    pub version: i64,
    /// Idempotency key
    pub request_id: String,
    /// Event class name
    pub event_type: String,
    /// Payload as a JSON string
    pub payload: String,
    /// Block height, if finalized
    pub block_height: Option<i64>,
    /// Event origin time, microseconds
    pub timestamp: i64,
}

/// A stored aggregate snapshot
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    /// Storage row id
    pub id: i64,
    /// Aggregate the snapshot belongs to
    pub aggregate_id: String,
    /// Block height the snapshot was taken at
    pub block_height: i64,
    /// Aggregate version at snapshot time
    pub version: i64,
    /// Serialized state as a JSON string (decompressed)
    pub payload: String,
    /// When the snapshot row was created
    pub created_at: DateTime<Utc>,
}

/// Lightweight point-in-time view of an aggregate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelView {
    /// Aggregate id
    pub aggregate_id: String,
    /// Aggregate version at the viewed point
    pub version: i64,
    /// Block height at the viewed point, `-1` when none applies
    pub block_height: i64,
    /// Serialized state as a JSON string
    pub payload: String,
}
