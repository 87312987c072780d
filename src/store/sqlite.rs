//! Embedded store
//!
//! Single-file SQLite backend: blob payloads, INTEGER row ids,
//! `INSERT OR IGNORE` idempotency, trigger-based integrity guards, and
//! bind-parameter-bounded bulk statements. The core here is shared with
//! the in-memory store, which differs only in pool setup, durable-image
//! flushing, and its rollback outbox policy.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;

use crate::idgen::{now_micros, MonotonicId};
use crate::model::event::NO_BLOCK_HEIGHT;
use crate::model::{
    AggregateRoot, EventRow, HistoryEvent, PendingEvent, SharedModel, SnapshotRetention,
    SnapshotRow, WireEvent,
};
use crate::payload;

use super::error::{StoreError, StoreResult};
use super::outbox::{plan_chunk, prefetch_limit, to_wire, OutboxRow, EMBEDDED_PREFETCH};
use super::registry::{Dialect, StatementRegistry};
use super::{
    BatchPublisher, EventFilter, OrderBy, OrderDir, PersistOutcome, ReplayOptions,
    StorageAdapter, EMBEDDED_MAX_BIND_PARAMS,
};

const CREATE_OUTBOX: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_version INTEGER NOT NULL,
    request_id TEXT NOT NULL,
    block_height INTEGER,
    payload BLOB NOT NULL,
    is_compressed INTEGER NOT NULL DEFAULT 0,
    payload_uncompressed_bytes INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    UNIQUE (aggregate_id, event_version)
)
"#;

const CREATE_OUTBOX_GUARDS: [&str; 2] = [
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_outbox_height_nonneg
    BEFORE INSERT ON outbox
    FOR EACH ROW WHEN NEW.block_height IS NOT NULL AND NEW.block_height < 0
    BEGIN SELECT RAISE(ABORT, 'outbox.block_height must be non-negative'); END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_outbox_version_nonneg
    BEFORE INSERT ON outbox
    FOR EACH ROW WHEN NEW.event_version < 0
    BEGIN SELECT RAISE(ABORT, 'outbox.event_version must be non-negative'); END
    "#,
];

const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    aggregate_id TEXT NOT NULL,
    block_height INTEGER NOT NULL,
    version INTEGER NOT NULL,
    payload BLOB NOT NULL,
    is_compressed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (aggregate_id, block_height)
)
"#;

const CREATE_SNAPSHOT_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_snapshots_aggregate_height ON snapshots (aggregate_id, block_height)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_height ON snapshots (block_height)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_created ON snapshots (created_at)",
];

const INSERT_OUTBOX: &str = r#"
INSERT OR IGNORE INTO outbox
    (id, aggregate_id, event_type, event_version, request_id, block_height,
     payload, is_compressed, payload_uncompressed_bytes, timestamp)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#;

const INSERT_SNAPSHOT: &str = r#"
INSERT OR IGNORE INTO snapshots
    (aggregate_id, block_height, version, payload, is_compressed, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#;

const SELECT_OUTBOX_CHUNK: &str = r#"
SELECT id, aggregate_id, event_type, event_version, request_id, block_height,
       payload, is_compressed, payload_uncompressed_bytes, timestamp
FROM outbox WHERE id > ?1 ORDER BY id ASC LIMIT ?2
"#;

/// What happens to the outbox when aggregates are rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboxRollback {
    /// Delete rows belonging to the rolled-back aggregates above the pivot
    Targeted,
    /// Drop every pending row
    Clear,
}

/// Shared SQLite engine behind the embedded and in-memory stores
pub(crate) struct SqliteCore {
    pool: SqlitePool,
    registry: StatementRegistry,
    ensured: DashSet<String>,
    base_schema_ready: AtomicBool,
    watermark: AtomicI64,
    idgen: Mutex<MonotonicId>,
    write_lock: Mutex<()>,
    deliver_lock: Mutex<()>,
    compress_snapshots: bool,
}

impl SqliteCore {
    pub(crate) fn new(pool: SqlitePool, compress_snapshots: bool) -> Self {
        Self {
            pool,
            registry: StatementRegistry::new(Dialect::Sqlite),
            ensured: DashSet::new(),
            base_schema_ready: AtomicBool::new(false),
            watermark: AtomicI64::new(0),
            idgen: Mutex::new(MonotonicId::default()),
            write_lock: Mutex::new(()),
            deliver_lock: Mutex::new(()),
            compress_snapshots,
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------------
    // Schema
    // ---------------------------------------------------------------------

    pub(crate) async fn ensure_base_schema(&self) -> StoreResult<()> {
        if self.base_schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        sqlx::query(CREATE_OUTBOX).execute(&self.pool).await?;
        for guard in CREATE_OUTBOX_GUARDS {
            sqlx::query(guard).execute(&self.pool).await?;
        }
        sqlx::query(CREATE_SNAPSHOTS).execute(&self.pool).await?;
        for index in CREATE_SNAPSHOT_INDEXES {
            sqlx::query(index).execute(&self.pool).await?;
        }

        self.base_schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn ensure_aggregate(&self, aggregate_id: &str) -> StoreResult<()> {
        self.ensure_base_schema().await?;
        if self.ensured.contains(aggregate_id) {
            return Ok(());
        }

        let stmts = self.registry.get(aggregate_id)?;
        for ddl in &stmts.ddl {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        self.ensured.insert(aggregate_id.to_string());
        Ok(())
    }

    pub(crate) async fn ensure_schema(&self, aggregate_ids: &[&str]) -> StoreResult<()> {
        self.ensure_base_schema().await?;
        for id in aggregate_ids {
            self.ensure_aggregate(id).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    pub(crate) async fn persist(&self, models: &[SharedModel]) -> StoreResult<PersistOutcome> {
        let _write = self.write_lock.lock().await;

        let mut guards = Vec::with_capacity(models.len());
        for model in models {
            guards.push(model.lock().await);
        }

        // Validate and snapshot the pending work before opening the
        // transaction; a bad event must fail the write synchronously.
        let mut work: Vec<(String, i64, Vec<PendingEvent>)> = Vec::new();
        for guard in &guards {
            let unsaved = guard.unsaved_events();
            if unsaved.is_empty() {
                continue;
            }
            let aggregate_id = guard.aggregate_id().to_string();
            self.registry.get(&aggregate_id)?;
            let start_version = guard.version() - unsaved.len() as i64 + 1;
            validate_pending(&aggregate_id, start_version, unsaved)?;
            work.push((aggregate_id, start_version, unsaved.to_vec()));
        }

        if work.is_empty() {
            return Ok(PersistOutcome::default());
        }

        for (aggregate_id, _, _) in &work {
            self.ensure_aggregate(aggregate_id).await?;
        }

        let outcome = match self.persist_in_tx(&work).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_idempotency_conflict() => {
                // The rows already exist from an earlier call; the
                // rolled-back retry is a successful no-op.
                tracing::debug!("duplicate write swallowed, persist treated as no-op");
                PersistOutcome::default()
            }
            Err(e) => return Err(e),
        };

        for guard in guards.iter_mut() {
            guard.mark_events_saved();
        }

        tracing::debug!(
            events = outcome.inserted_outbox_ids.len(),
            first_id = outcome.first_id,
            last_id = outcome.last_id,
            "persisted events and outbox rows"
        );

        Ok(outcome)
    }

    async fn persist_in_tx(
        &self,
        work: &[(String, i64, Vec<PendingEvent>)],
    ) -> StoreResult<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        let mut tx = self.pool.begin().await?;

        for (aggregate_id, start_version, events) in work {
            let stmts = self.registry.get(aggregate_id)?;

            for (i, event) in events.iter().enumerate() {
                let version = start_version + i as i64;
                let buf = payload::encode(&event.payload, true)?;

                let inserted = sqlx::query(&stmts.insert_event)
                    .bind(version)
                    .bind(&event.request_id)
                    .bind(&event.event_type)
                    .bind(&buf.bytes)
                    .bind(event.block_height)
                    .bind(buf.is_compressed)
                    .bind(event.timestamp)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::classify)?;

                if inserted.rows_affected() == 0 {
                    // Same (version, request_id) already persisted
                    continue;
                }

                let ts = now_micros();
                let outbox_id = self.idgen.lock().await.next(ts);

                let enqueued = sqlx::query(INSERT_OUTBOX)
                    .bind(outbox_id)
                    .bind(aggregate_id)
                    .bind(&event.event_type)
                    .bind(version)
                    .bind(&event.request_id)
                    .bind(event.block_height)
                    .bind(&buf.bytes)
                    .bind(buf.is_compressed)
                    .bind(buf.uncompressed_bytes)
                    .bind(event.timestamp)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::classify)?;

                if enqueued.rows_affected() == 0 {
                    continue;
                }

                if outcome.inserted_outbox_ids.is_empty() {
                    outcome.first_ts = ts;
                    outcome.first_id = outbox_id;
                }
                outcome.last_ts = ts;
                outcome.last_id = outbox_id;
                outcome.inserted_outbox_ids.push(outbox_id);
                outcome.raw_events.push(WireEvent {
                    model_name: aggregate_id.clone(),
                    event_type: event.event_type.clone(),
                    event_version: version,
                    request_id: event.request_id.clone(),
                    block_height: event.block_height.unwrap_or(NO_BLOCK_HEIGHT),
                    payload: event.payload.clone(),
                    timestamp: event.timestamp,
                });
            }
        }

        tx.commit().await.map_err(StoreError::classify)?;

        Ok(outcome)
    }

    pub(crate) async fn delete_outbox_by_ids(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        delete_outbox_chunked(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn has_backlog_before(&self, id: i64) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox WHERE id < ?1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub(crate) async fn has_pending_after_watermark(&self) -> StoreResult<bool> {
        let last_seen = self.watermark.load(Ordering::Acquire);
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox WHERE id > ?1)")
                .bind(last_seen)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    // ---------------------------------------------------------------------
    // Delivery
    // ---------------------------------------------------------------------

    pub(crate) async fn fetch_deliver_ack_chunk(
        &self,
        transport_cap_bytes: u64,
        publisher: &dyn BatchPublisher,
    ) -> StoreResult<usize> {
        let _deliver = self.deliver_lock.lock().await;

        let last_seen = self.watermark.load(Ordering::Acquire);
        let limit = prefetch_limit(transport_cap_bytes, EMBEDDED_PREFETCH);

        let rows: Vec<OutboxRow> = sqlx::query_as(SELECT_OUTBOX_CHUNK)
            .bind(last_seen)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let take = plan_chunk(&rows, transport_cap_bytes);
        let accepted = &rows[..take];

        let batch: Vec<WireEvent> = accepted.iter().map(to_wire).collect::<StoreResult<_>>()?;
        publisher.publish_batch_with_ack(batch).await?;

        // Short ACK transaction; only after the transport confirmed
        let ids: Vec<i64> = accepted.iter().map(|r| r.id).collect();
        let highest = ids.last().copied().unwrap_or(last_seen);
        {
            let _write = self.write_lock.lock().await;
            let mut tx = self.pool.begin().await?;
            delete_outbox_chunked(&mut tx, &ids).await?;
            tx.commit().await?;
        }

        self.watermark.store(highest, Ordering::Release);

        tracing::debug!(delivered = ids.len(), watermark = highest, "outbox chunk acked");
        Ok(ids.len())
    }

    // ---------------------------------------------------------------------
    // Rollback
    // ---------------------------------------------------------------------

    pub(crate) async fn rollback(
        &self,
        aggregate_ids: &[&str],
        block_height: i64,
        outbox_policy: OutboxRollback,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;

        let mut stmts = Vec::with_capacity(aggregate_ids.len());
        for id in aggregate_ids {
            stmts.push((*id, self.registry.get(id)?));
        }

        let mut tx = self.pool.begin().await?;

        for (_, bundle) in &stmts {
            sqlx::query(&bundle.delete_above_height)
                .bind(block_height)
                .execute(&mut *tx)
                .await?;
        }

        for chunk in aggregate_ids.chunks(EMBEDDED_MAX_BIND_PARAMS.saturating_sub(1)) {
            let placeholders = placeholders_from(2, chunk.len());
            let sql = format!(
                "DELETE FROM snapshots WHERE block_height > ?1 AND aggregate_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(block_height);
            for id in chunk {
                query = query.bind(*id);
            }
            query.execute(&mut *tx).await?;
        }

        match outbox_policy {
            OutboxRollback::Targeted => {
                for chunk in aggregate_ids.chunks(EMBEDDED_MAX_BIND_PARAMS.saturating_sub(1)) {
                    let placeholders = placeholders_from(2, chunk.len());
                    let sql = format!(
                        "DELETE FROM outbox WHERE block_height > ?1 AND aggregate_id IN ({placeholders})"
                    );
                    let mut query = sqlx::query(&sql).bind(block_height);
                    for id in chunk {
                        query = query.bind(*id);
                    }
                    query.execute(&mut *tx).await?;
                }
            }
            OutboxRollback::Clear => {
                sqlx::query("DELETE FROM outbox").execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;
        self.watermark.store(0, Ordering::Release);

        tracing::info!(
            aggregates = aggregate_ids.len(),
            block_height,
            "rolled back above pivot height"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Rehydration
    // ---------------------------------------------------------------------

    pub(crate) async fn apply_events(
        &self,
        model: &mut dyn AggregateRoot,
        options: ReplayOptions,
    ) -> StoreResult<()> {
        let stmts = self.registry.get(model.aggregate_id())?;
        let mut last_version = options.last_version;

        loop {
            let rows: Vec<(i64, i64, String, String, Vec<u8>, Option<i64>, bool, i64)> =
                match options.block_height {
                    Some(height) => {
                        sqlx::query_as(&stmts.select_after_version_below_height)
                            .bind(last_version)
                            .bind(height)
                            .bind(options.batch_size)
                            .fetch_all(&self.pool)
                            .await?
                    }
                    None => {
                        sqlx::query_as(&stmts.select_after_version)
                            .bind(last_version)
                            .bind(options.batch_size)
                            .fetch_all(&self.pool)
                            .await?
                    }
                };

            if rows.is_empty() {
                break;
            }
            let fetched = rows.len();
            last_version = rows[fetched - 1].1;

            let batch: Vec<HistoryEvent> = rows
                .into_iter()
                .map(|(_, version, request_id, event_type, bytes, height, compressed, ts)| {
                    Ok(HistoryEvent {
                        version,
                        event_type,
                        request_id,
                        block_height: height,
                        timestamp: ts,
                        payload: payload::decode(&bytes, compressed)?,
                    })
                })
                .collect::<StoreResult<_>>()?;

            model.load_from_history(batch)?;

            if (fetched as i64) < options.batch_size {
                break;
            }
        }

        Ok(())
    }

    pub(crate) async fn find_latest_snapshot(
        &self,
        aggregate_id: &str,
    ) -> StoreResult<Option<SnapshotRow>> {
        let row: Option<(i64, String, i64, i64, Vec<u8>, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, aggregate_id, block_height, version, payload, is_compressed, created_at
            FROM snapshots WHERE aggregate_id = ?1
            ORDER BY block_height DESC LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_snapshot).transpose()
    }

    pub(crate) async fn find_latest_snapshot_before_height(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<Option<SnapshotRow>> {
        let row: Option<(i64, String, i64, i64, Vec<u8>, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, aggregate_id, block_height, version, payload, is_compressed, created_at
            FROM snapshots WHERE aggregate_id = ?1 AND block_height <= ?2
            ORDER BY block_height DESC LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .bind(block_height)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_snapshot).transpose()
    }

    pub(crate) async fn restore_at_height(
        &self,
        model: &mut dyn AggregateRoot,
        block_height: i64,
    ) -> StoreResult<()> {
        let snapshot = self
            .find_latest_snapshot_before_height(model.aggregate_id(), block_height)
            .await?;

        let last_version = match snapshot {
            Some(snap) => {
                let version = snap.version;
                model.restore_from_snapshot(&snap)?;
                version
            }
            None => 0,
        };

        self.apply_events(
            model,
            ReplayOptions {
                block_height: Some(block_height),
                last_version,
                ..ReplayOptions::default()
            },
        )
        .await
    }

    pub(crate) async fn restore_latest(&self, model: &mut dyn AggregateRoot) -> StoreResult<()> {
        let snapshot = self.find_latest_snapshot(model.aggregate_id()).await?;

        let last_version = match snapshot {
            Some(snap) => {
                let version = snap.version;
                model.restore_from_snapshot(&snap)?;
                version
            }
            None => 0,
        };

        self.apply_events(
            model,
            ReplayOptions {
                last_version,
                ..ReplayOptions::default()
            },
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    pub(crate) async fn create_snapshot(
        &self,
        model: &mut dyn AggregateRoot,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;
        self.ensure_base_schema().await?;

        let aggregate_id = model.aggregate_id().to_string();
        let block_height = model.last_block_height().ok_or_else(|| {
            StoreError::InvalidEvent(format!(
                "aggregate {aggregate_id} has no block height to snapshot at"
            ))
        })?;

        let state = model.to_snapshot()?;
        let buf = payload::encode(&state, self.compress_snapshots)?;

        let result = sqlx::query(INSERT_SNAPSHOT)
            .bind(&aggregate_id)
            .bind(block_height)
            .bind(model.version())
            .bind(&buf.bytes)
            .bind(buf.is_compressed)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(StoreError::classify);

        let inserted = match result {
            Ok(done) => done.rows_affected(),
            // Snapshot already present at this (aggregate_id, block_height)
            Err(e) if e.is_idempotency_conflict() => 0,
            Err(e) => return Err(e),
        };

        model.reset_snapshot_counter();

        if inserted > 0 {
            tracing::info!(
                aggregate_id = %aggregate_id,
                block_height,
                version = model.version(),
                "snapshot created"
            );
        }

        if model.allow_pruning() {
            self.prune_snapshots_locked(&aggregate_id, block_height, retention)
                .await?;
        }

        Ok(())
    }

    /// Retention pruning; caller must hold the write lock
    async fn prune_snapshots_locked(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        let keep_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM snapshots WHERE aggregate_id = ?1 ORDER BY block_height DESC LIMIT ?2",
        )
        .bind(aggregate_id)
        .bind(retention.min_keep as i64)
        .fetch_all(&self.pool)
        .await?;

        let protected_from = if retention.keep_window > 0 {
            Some((current_height - retention.keep_window as i64).max(0))
        } else {
            None
        };

        let mut sql = String::from(
            "SELECT id FROM snapshots WHERE aggregate_id = ?1",
        );
        if protected_from.is_some() {
            sql.push_str(" AND block_height < ?2");
        }
        let mut query = sqlx::query_scalar(&sql).bind(aggregate_id);
        if let Some(cutoff) = protected_from {
            query = query.bind(cutoff);
        }
        let candidates: Vec<i64> = query.fetch_all(&self.pool).await?;

        let doomed: Vec<i64> = candidates
            .into_iter()
            .filter(|id| !keep_ids.contains(id))
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in doomed.chunks(EMBEDDED_MAX_BIND_PARAMS) {
            let placeholders = placeholders_from(1, chunk.len());
            let sql = format!("DELETE FROM snapshots WHERE id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            pruned = doomed.len(),
            "old snapshots pruned"
        );
        Ok(())
    }

    pub(crate) async fn prune_old_snapshots(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;
        self.prune_snapshots_locked(aggregate_id, current_height, retention)
            .await
    }

    pub(crate) async fn prune_events_below(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;
        let stmts = self.registry.get(aggregate_id)?;
        sqlx::query(&stmts.delete_below_height)
            .bind(block_height)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub(crate) async fn fetch_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<EventRow>> {
        self.registry.get(aggregate_id)?;

        let (sql, binds) = build_filter_query(aggregate_id, filter);
        let mut query = sqlx::query_as::<
            Sqlite,
            (i64, i64, String, String, Vec<u8>, Option<i64>, bool, i64),
        >(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(id, version, request_id, event_type, bytes, height, compressed, ts)| {
                Ok(EventRow {
                    id,
                    version,
                    request_id,
                    event_type,
                    payload: payload::decode(&bytes, compressed)?,
                    block_height: height,
                    timestamp: ts,
                })
            })
            .collect()
    }

    pub(crate) fn watermark(&self) -> i64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub(crate) async fn pending_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Validate a batch of unsaved events before any SQL runs
pub(crate) fn validate_pending(
    aggregate_id: &str,
    start_version: i64,
    events: &[PendingEvent],
) -> StoreResult<()> {
    if start_version < 1 {
        return Err(StoreError::InvalidEvent(format!(
            "aggregate {aggregate_id} version does not cover its unsaved events"
        )));
    }
    for event in events {
        if event.request_id.is_empty() {
            return Err(StoreError::InvalidEvent(format!(
                "event {} on {aggregate_id} is missing a request id",
                event.event_type
            )));
        }
        if event.timestamp <= 0 {
            return Err(StoreError::InvalidEvent(format!(
                "event {} on {aggregate_id} is missing a timestamp",
                event.event_type
            )));
        }
        if event.block_height.is_some_and(|h| h < 0) {
            return Err(StoreError::InvalidEvent(format!(
                "event {} on {aggregate_id} has a negative block height",
                event.event_type
            )));
        }
    }
    Ok(())
}

/// `?n` placeholder list starting at position `start`
fn placeholders_from(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Chunked outbox delete inside an open transaction
async fn delete_outbox_chunked(
    tx: &mut Transaction<'_, Sqlite>,
    ids: &[i64],
) -> StoreResult<()> {
    for chunk in ids.chunks(EMBEDDED_MAX_BIND_PARAMS) {
        let placeholders = placeholders_from(1, chunk.len());
        let sql = format!("DELETE FROM outbox WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(*id);
        }
        query.execute(&mut **tx).await?;
    }
    Ok(())
}

fn decode_snapshot(
    (id, aggregate_id, block_height, version, bytes, compressed, created_at): (
        i64,
        String,
        i64,
        i64,
        Vec<u8>,
        bool,
        DateTime<Utc>,
    ),
) -> StoreResult<SnapshotRow> {
    Ok(SnapshotRow {
        id,
        aggregate_id,
        block_height,
        version,
        payload: payload::decode(&bytes, compressed)?,
        created_at,
    })
}

/// Build the filtered read query for one aggregate table
fn build_filter_query(aggregate_id: &str, filter: &EventFilter) -> (String, Vec<i64>) {
    let mut sql = format!(
        r#"SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp FROM "{aggregate_id}" WHERE 1=1"#
    );
    let mut binds: Vec<i64> = Vec::new();

    if let Some(v) = filter.version_gte {
        sql.push_str(" AND version >= ?");
        binds.push(v);
    }
    if let Some(v) = filter.version_lte {
        sql.push_str(" AND version <= ?");
        binds.push(v);
    }
    if let Some(h) = filter.height_gte {
        sql.push_str(" AND block_height IS NOT NULL AND block_height >= ?");
        binds.push(h);
    }
    if let Some(h) = filter.height_lte {
        sql.push_str(" AND block_height IS NOT NULL AND block_height <= ?");
        binds.push(h);
    }

    let column = match filter.order_by {
        OrderBy::Version => "version",
        OrderBy::CreatedAt => "timestamp",
    };
    let direction = match filter.order_dir {
        OrderDir::Asc => "ASC",
        OrderDir::Desc => "DESC",
    };
    sql.push_str(&format!(" ORDER BY {column} {direction}"));

    if filter.limit.is_some() || filter.offset.is_some() {
        sql.push_str(" LIMIT ?");
        binds.push(filter.limit.unwrap_or(i64::MAX));
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ?");
            binds.push(offset);
        }
    }

    (sql, binds)
}

// =========================================================================
// Embedded store
// =========================================================================

/// Embedded single-file store
pub struct SqliteStore {
    core: SqliteCore,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let core = SqliteCore::new(pool, false);
        core.ensure_base_schema().await?;
        Ok(Self { core })
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn ensure_schema(&self, aggregate_ids: &[&str]) -> StoreResult<()> {
        self.core.ensure_schema(aggregate_ids).await
    }

    async fn persist_aggregates_and_outbox(
        &self,
        models: &[SharedModel],
    ) -> StoreResult<PersistOutcome> {
        self.core.persist(models).await
    }

    async fn delete_outbox_by_ids(&self, ids: &[i64]) -> StoreResult<()> {
        self.core.delete_outbox_by_ids(ids).await
    }

    async fn has_backlog_before(&self, _ts_micros: i64, id: i64) -> StoreResult<bool> {
        self.core.has_backlog_before(id).await
    }

    async fn has_pending_after_watermark(&self) -> StoreResult<bool> {
        self.core.has_pending_after_watermark().await
    }

    async fn fetch_deliver_ack_chunk(
        &self,
        transport_cap_bytes: u64,
        publisher: &dyn BatchPublisher,
    ) -> StoreResult<usize> {
        self.core
            .fetch_deliver_ack_chunk(transport_cap_bytes, publisher)
            .await
    }

    async fn rollback_aggregates(
        &self,
        aggregate_ids: &[&str],
        block_height: i64,
    ) -> StoreResult<()> {
        self.core
            .rollback(aggregate_ids, block_height, OutboxRollback::Targeted)
            .await
    }

    async fn apply_events_to_aggregate(
        &self,
        model: &mut dyn AggregateRoot,
        options: ReplayOptions,
    ) -> StoreResult<()> {
        self.core.apply_events(model, options).await
    }

    async fn create_snapshot(
        &self,
        model: &mut dyn AggregateRoot,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        self.core.create_snapshot(model, retention).await
    }

    async fn find_latest_snapshot(&self, aggregate_id: &str) -> StoreResult<Option<SnapshotRow>> {
        self.core.find_latest_snapshot(aggregate_id).await
    }

    async fn find_latest_snapshot_before_height(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<Option<SnapshotRow>> {
        self.core
            .find_latest_snapshot_before_height(aggregate_id, block_height)
            .await
    }

    async fn restore_exact_state_at_height(
        &self,
        model: &mut dyn AggregateRoot,
        block_height: i64,
    ) -> StoreResult<()> {
        self.core.restore_at_height(model, block_height).await
    }

    async fn restore_exact_state_latest(&self, model: &mut dyn AggregateRoot) -> StoreResult<()> {
        self.core.restore_latest(model).await
    }

    async fn prune_old_snapshots(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        self.core
            .prune_old_snapshots(aggregate_id, current_height, retention)
            .await
    }

    async fn prune_events_below(&self, aggregate_id: &str, block_height: i64) -> StoreResult<()> {
        self.core.prune_events_below(aggregate_id, block_height).await
    }

    async fn fetch_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<EventRow>> {
        self.core.fetch_events_for_one(aggregate_id, filter).await
    }

    async fn outbox_watermark(&self) -> i64 {
        self.core.watermark()
    }

    async fn outbox_pending_count(&self) -> StoreResult<i64> {
        self.core.pending_count().await
    }
}
