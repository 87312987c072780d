//! Common test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use chainstore::{
    AggregateRoot, BatchPublisher, HistoryEvent, PendingEvent, SnapshotRetention, SnapshotRow,
    SqliteStore, StoreError, StoreResult, WireEvent,
};

/// Install a test subscriber once so RUST_LOG works in tests
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open an embedded store on a fresh temporary database file.
///
/// The returned directory guard must stay alive for the store's lifetime.
pub async fn sqlite_store() -> (SqliteStore, TempDir) {
    init_tracing();
    let dir = TempDir::new().expect("create temp dir");
    let store = SqliteStore::open(dir.path().join("events.db"))
        .await
        .expect("open sqlite store");
    (store, dir)
}

/// Test aggregate: a ledger summing deposited amounts per block
pub struct TestLedger {
    aggregate_id: String,
    version: i64,
    last_block_height: Option<i64>,
    total: i64,
    unsaved: Vec<PendingEvent>,
    snapshot_requested: bool,
    allow_pruning: bool,
    retention: SnapshotRetention,
}

/// Serialized ledger state used for snapshots
#[derive(Debug, Serialize, Deserialize)]
struct LedgerState {
    version: i64,
    last_block_height: Option<i64>,
    total: i64,
}

impl TestLedger {
    pub fn new(aggregate_id: &str) -> Self {
        Self {
            aggregate_id: aggregate_id.to_string(),
            version: 0,
            last_block_height: None,
            total: 0,
            unsaved: Vec::new(),
            snapshot_requested: false,
            allow_pruning: false,
            retention: SnapshotRetention::default(),
        }
    }

    /// Record a deposit with a random request id
    pub fn deposit(&mut self, amount: i64, block_height: Option<i64>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.deposit_with_request(amount, block_height, &request_id);
    }

    /// Record a deposit with a caller-chosen request id (idempotency tests)
    pub fn deposit_with_request(
        &mut self,
        amount: i64,
        block_height: Option<i64>,
        request_id: &str,
    ) {
        self.version += 1;
        self.total += amount;
        if let Some(height) = block_height {
            self.last_block_height = Some(self.last_block_height.map_or(height, |h| h.max(height)));
        }
        self.unsaved.push(PendingEvent {
            event_type: "Deposited".to_string(),
            request_id: request_id.to_string(),
            block_height,
            timestamp: chainstore::idgen::now_micros(),
            payload: format!(r#"{{"amount":{amount}}}"#),
        });
    }

    /// Push a raw pending event, bypassing the ledger bookkeeping
    pub fn push_raw(&mut self, event: PendingEvent) {
        self.version += 1;
        self.unsaved.push(event);
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn request_snapshot(&mut self) {
        self.snapshot_requested = true;
    }

    pub fn enable_pruning(&mut self, retention: SnapshotRetention) {
        self.allow_pruning = true;
        self.retention = retention;
    }
}

impl AggregateRoot for TestLedger {
    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn last_block_height(&self) -> Option<i64> {
        self.last_block_height
    }

    fn allow_pruning(&self) -> bool {
        self.allow_pruning
    }

    fn unsaved_events(&self) -> &[PendingEvent] {
        &self.unsaved
    }

    fn mark_events_saved(&mut self) {
        self.unsaved.clear();
    }

    fn load_from_history(&mut self, batch: Vec<HistoryEvent>) -> Result<(), StoreError> {
        for event in batch {
            let value: serde_json::Value = serde_json::from_str(&event.payload)?;
            let amount = value["amount"].as_i64().ok_or_else(|| {
                StoreError::InvalidEvent(format!("event {} has no amount", event.version))
            })?;
            self.total += amount;
            self.version = event.version;
            if let Some(height) = event.block_height {
                self.last_block_height =
                    Some(self.last_block_height.map_or(height, |h| h.max(height)));
            }
        }
        Ok(())
    }

    fn to_snapshot(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&LedgerState {
            version: self.version,
            last_block_height: self.last_block_height,
            total: self.total,
        })?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &SnapshotRow) -> Result<(), StoreError> {
        let state: LedgerState = serde_json::from_str(&snapshot.payload)?;
        self.version = state.version;
        self.last_block_height = state.last_block_height;
        self.total = state.total;
        self.unsaved.clear();
        Ok(())
    }

    fn can_make_snapshot(&self) -> bool {
        self.snapshot_requested
    }

    fn snapshot_retention(&self) -> SnapshotRetention {
        self.retention
    }

    fn reset_snapshot_counter(&mut self) {
        self.snapshot_requested = false;
    }
}

/// Publisher recording delivered batches; can be switched into failure mode
pub struct TestPublisher {
    batches: Mutex<Vec<Vec<WireEvent>>>,
    failing: AtomicBool,
}

impl TestPublisher {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<WireEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<WireEvent> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl BatchPublisher for TestPublisher {
    async fn publish_batch_with_ack(&self, batch: Vec<WireEvent>) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Delivery("transport unavailable".to_string()));
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}
