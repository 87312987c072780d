//! Outbox delivery planning
//!
//! Backend-independent policy for the drain loop: how many rows to
//! prefetch for a given frame budget, which prefix of them fits under the
//! budget, and how a stored row becomes a wire record.

use crate::model::event::NO_BLOCK_HEIGHT;
use crate::model::WireEvent;
use crate::payload;

use super::error::StoreResult;

/// Fixed per-record overhead assumed when budgeting a frame
pub const FIXED_EVENT_OVERHEAD_BYTES: u64 = 256;

/// Assumed average event size when sizing a prefetch
pub const AVG_EVENT_BYTES_GUESS: u64 = 1024;

/// Prefetch clamp bounds for one drain chunk
#[derive(Debug, Clone, Copy)]
pub struct PrefetchBounds {
    pub min: i64,
    pub max: i64,
}

/// Bounds for the embedded and in-memory stores
pub const EMBEDDED_PREFETCH: PrefetchBounds = PrefetchBounds {
    min: 256,
    max: 8192,
};

/// Bounds for the server store
pub const SERVER_PREFETCH: PrefetchBounds = PrefetchBounds {
    min: 1024,
    max: 32768,
};

/// One pending outbox row as read from storage
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_version: i64,
    pub request_id: String,
    pub block_height: Option<i64>,
    pub payload: Vec<u8>,
    pub is_compressed: bool,
    pub payload_uncompressed_bytes: i64,
    pub timestamp: i64,
}

/// Number of rows to prefetch for a frame budget, clamped to the bounds
pub fn prefetch_limit(transport_cap_bytes: u64, bounds: PrefetchBounds) -> i64 {
    let estimate = (transport_cap_bytes / AVG_EVENT_BYTES_GUESS) as i64;
    estimate.clamp(bounds.min, bounds.max)
}

/// Length of the longest prefix of `rows` that fits the frame budget.
///
/// Rows are accepted greedily while
/// `running + FIXED_EVENT_OVERHEAD_BYTES + payload_uncompressed_bytes`
/// stays within the budget; the first row is always accepted so an
/// oversized event cannot wedge the queue.
pub fn plan_chunk(rows: &[OutboxRow], transport_cap_bytes: u64) -> usize {
    let mut accepted = 0usize;
    let mut running = 0u64;

    for row in rows {
        let cost = FIXED_EVENT_OVERHEAD_BYTES + row.payload_uncompressed_bytes.max(0) as u64;
        if accepted > 0 && running + cost > transport_cap_bytes {
            break;
        }
        running += cost;
        accepted += 1;
    }

    accepted
}

/// Build the wire record for one outbox row
pub fn to_wire(row: &OutboxRow) -> StoreResult<WireEvent> {
    Ok(WireEvent {
        model_name: row.aggregate_id.clone(),
        event_type: row.event_type.clone(),
        event_version: row.event_version,
        request_id: row.request_id.clone(),
        block_height: row.block_height.unwrap_or(NO_BLOCK_HEIGHT),
        payload: payload::decode(&row.payload, row.is_compressed)?,
        timestamp: row.timestamp,
    })
}
