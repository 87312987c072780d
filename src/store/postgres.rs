//! Server store
//!
//! PostgreSQL backend: bytea payloads, BIGINT ids, CHECK integrity guards,
//! `ON CONFLICT ... DO NOTHING` idempotency, large bind-parameter budgets,
//! snapshot compression, and cursor-style streaming reads.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::BoxStream;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::idgen::{now_micros, MonotonicId};
use crate::model::event::NO_BLOCK_HEIGHT;
use crate::model::{
    AggregateRoot, EventRow, HistoryEvent, PendingEvent, SharedModel, SnapshotRetention,
    SnapshotRow, WireEvent,
};
use crate::payload;

use super::error::{StoreError, StoreResult};
use super::outbox::{plan_chunk, prefetch_limit, to_wire, OutboxRow, SERVER_PREFETCH};
use super::registry::{Dialect, StatementRegistry};
use super::{
    BatchPublisher, EventFilter, OrderBy, OrderDir, PersistOutcome, ReplayOptions,
    StorageAdapter, SERVER_MAX_BIND_PARAMS,
};

const CREATE_OUTBOX: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id BIGINT PRIMARY KEY,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_version BIGINT NOT NULL CHECK (event_version >= 0),
    request_id TEXT NOT NULL,
    block_height BIGINT CHECK (block_height IS NULL OR block_height >= 0),
    payload BYTEA NOT NULL,
    is_compressed BOOLEAN NOT NULL DEFAULT FALSE,
    payload_uncompressed_bytes BIGINT NOT NULL,
    timestamp BIGINT NOT NULL,
    UNIQUE (aggregate_id, event_version)
)
"#;

const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    id BIGSERIAL PRIMARY KEY,
    aggregate_id TEXT NOT NULL,
    block_height BIGINT NOT NULL CHECK (block_height >= 0),
    version BIGINT NOT NULL,
    payload BYTEA NOT NULL,
    is_compressed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (aggregate_id, block_height)
)
"#;

const CREATE_SNAPSHOT_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_snapshots_aggregate_height ON snapshots (aggregate_id, block_height)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_height ON snapshots (block_height)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_created ON snapshots (created_at)",
];

const INSERT_OUTBOX: &str = r#"
INSERT INTO outbox
    (id, aggregate_id, event_type, event_version, request_id, block_height,
     payload, is_compressed, payload_uncompressed_bytes, timestamp)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (aggregate_id, event_version) DO NOTHING
"#;

const INSERT_SNAPSHOT: &str = r#"
INSERT INTO snapshots (aggregate_id, block_height, version, payload, is_compressed, created_at)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (aggregate_id, block_height) DO NOTHING
"#;

const SELECT_OUTBOX_CHUNK: &str = r#"
SELECT id, aggregate_id, event_type, event_version, request_id, block_height,
       payload, is_compressed, payload_uncompressed_bytes, timestamp
FROM outbox WHERE id > $1 ORDER BY id ASC LIMIT $2
"#;

/// Page size used by the streaming read pump
const STREAM_PAGE_SIZE: i64 = 5000;

/// Server store on PostgreSQL
pub struct PostgresStore {
    pool: PgPool,
    registry: StatementRegistry,
    ensured: DashSet<String>,
    base_schema_ready: AtomicBool,
    watermark: AtomicI64,
    idgen: Mutex<MonotonicId>,
    write_lock: Mutex<()>,
    deliver_lock: Mutex<()>,
}

impl PostgresStore {
    /// Connect to the database and ensure the global tables exist
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self {
            pool,
            registry: StatementRegistry::new(Dialect::Postgres),
            ensured: DashSet::new(),
            base_schema_ready: AtomicBool::new(false),
            watermark: AtomicI64::new(0),
            idgen: Mutex::new(MonotonicId::default()),
            write_lock: Mutex::new(()),
            deliver_lock: Mutex::new(()),
        };
        store.ensure_base_schema().await?;
        Ok(store)
    }

    async fn ensure_base_schema(&self) -> StoreResult<()> {
        if self.base_schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        sqlx::query(CREATE_OUTBOX).execute(&self.pool).await?;
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

    async fn prune_snapshots_locked(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        let keep_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM snapshots WHERE aggregate_id = $1 ORDER BY block_height DESC LIMIT $2",
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

        let mut sql = String::from("SELECT id FROM snapshots WHERE aggregate_id = $1");
        if protected_from.is_some() {
            sql.push_str(" AND block_height < $2");
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
        for chunk in doomed.chunks(SERVER_MAX_BIND_PARAMS) {
            let placeholders = pg_placeholders(1, chunk.len());
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
}

#[async_trait]
impl StorageAdapter for PostgresStore {
    async fn ensure_schema(&self, aggregate_ids: &[&str]) -> StoreResult<()> {
        self.ensure_base_schema().await?;
        for id in aggregate_ids {
            self.ensure_aggregate(id).await?;
        }
        Ok(())
    }

    async fn persist_aggregates_and_outbox(
        &self,
        models: &[SharedModel],
    ) -> StoreResult<PersistOutcome> {
        let _write = self.write_lock.lock().await;

        let mut guards = Vec::with_capacity(models.len());
        for model in models {
            guards.push(model.lock().await);
        }

        let mut work: Vec<(String, i64, Vec<PendingEvent>)> = Vec::new();
        for guard in &guards {
            let unsaved = guard.unsaved_events();
            if unsaved.is_empty() {
                continue;
            }
            let aggregate_id = guard.aggregate_id().to_string();
            self.registry.get(&aggregate_id)?;
            let start_version = guard.version() - unsaved.len() as i64 + 1;
            super::sqlite::validate_pending(&aggregate_id, start_version, unsaved)?;
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

    async fn delete_outbox_by_ids(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        delete_outbox_chunked(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_backlog_before(&self, _ts_micros: i64, id: i64) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox WHERE id < $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn has_pending_after_watermark(&self) -> StoreResult<bool> {
        let last_seen = self.watermark.load(Ordering::Acquire);
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox WHERE id > $1)")
                .bind(last_seen)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn fetch_deliver_ack_chunk(
        &self,
        transport_cap_bytes: u64,
        publisher: &dyn BatchPublisher,
    ) -> StoreResult<usize> {
        let _deliver = self.deliver_lock.lock().await;

        let last_seen = self.watermark.load(Ordering::Acquire);
        let limit = prefetch_limit(transport_cap_bytes, SERVER_PREFETCH);

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

    async fn rollback_aggregates(
        &self,
        aggregate_ids: &[&str],
        block_height: i64,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;

        let mut stmts = Vec::with_capacity(aggregate_ids.len());
        for id in aggregate_ids {
            stmts.push(self.registry.get(id)?);
        }

        let mut tx = self.pool.begin().await?;

        for bundle in &stmts {
            sqlx::query(&bundle.delete_above_height)
                .bind(block_height)
                .execute(&mut *tx)
                .await?;
        }

        for chunk in aggregate_ids.chunks(SERVER_MAX_BIND_PARAMS.saturating_sub(1)) {
            let placeholders = pg_placeholders(2, chunk.len());
            let sql = format!(
                "DELETE FROM snapshots WHERE block_height > $1 AND aggregate_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(block_height);
            for id in chunk {
                query = query.bind(*id);
            }
            query.execute(&mut *tx).await?;
        }

        sqlx::query("TRUNCATE TABLE outbox").execute(&mut *tx).await?;

        tx.commit().await?;
        self.watermark.store(0, Ordering::Release);

        tracing::info!(
            aggregates = aggregate_ids.len(),
            block_height,
            "rolled back above pivot height"
        );
        Ok(())
    }

    async fn apply_events_to_aggregate(
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

    async fn create_snapshot(
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
        let buf = payload::encode(&state, true)?;

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

    async fn find_latest_snapshot(&self, aggregate_id: &str) -> StoreResult<Option<SnapshotRow>> {
        let row: Option<(i64, String, i64, i64, Vec<u8>, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, aggregate_id, block_height, version, payload, is_compressed, created_at
            FROM snapshots WHERE aggregate_id = $1
            ORDER BY block_height DESC LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_snapshot).transpose()
    }

    async fn find_latest_snapshot_before_height(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<Option<SnapshotRow>> {
        let row: Option<(i64, String, i64, i64, Vec<u8>, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, aggregate_id, block_height, version, payload, is_compressed, created_at
            FROM snapshots WHERE aggregate_id = $1 AND block_height <= $2
            ORDER BY block_height DESC LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .bind(block_height)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_snapshot).transpose()
    }

    async fn restore_exact_state_at_height(
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

        self.apply_events_to_aggregate(
            model,
            ReplayOptions {
                block_height: Some(block_height),
                last_version,
                ..ReplayOptions::default()
            },
        )
        .await
    }

    async fn restore_exact_state_latest(&self, model: &mut dyn AggregateRoot) -> StoreResult<()> {
        let snapshot = self.find_latest_snapshot(model.aggregate_id()).await?;

        let last_version = match snapshot {
            Some(snap) => {
                let version = snap.version;
                model.restore_from_snapshot(&snap)?;
                version
            }
            None => 0,
        };

        self.apply_events_to_aggregate(
            model,
            ReplayOptions {
                last_version,
                ..ReplayOptions::default()
            },
        )
        .await
    }

    async fn prune_old_snapshots(
        &self,
        aggregate_id: &str,
        current_height: i64,
        retention: SnapshotRetention,
    ) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;
        self.prune_snapshots_locked(aggregate_id, current_height, retention)
            .await
    }

    async fn prune_events_below(&self, aggregate_id: &str, block_height: i64) -> StoreResult<()> {
        let _write = self.write_lock.lock().await;
        let stmts = self.registry.get(aggregate_id)?;
        sqlx::query(&stmts.delete_below_height)
            .bind(block_height)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<EventRow>> {
        self.registry.get(aggregate_id)?;

        let (sql, binds) = build_filter_query(aggregate_id, filter);
        let mut query = sqlx::query_as::<
            Postgres,
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

    /// Cursor-style stream, paged by version under the hood. Rows are
    /// always produced in ascending version order.
    async fn stream_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<EventRow>>> {
        self.registry.get(aggregate_id)?;

        let pool = self.pool.clone();
        let aggregate_id = aggregate_id.to_string();
        let filter = filter.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<StoreResult<EventRow>>(64);

        tokio::spawn(async move {
            let mut cursor = filter.version_gte.map(|v| v - 1).unwrap_or(0);
            let mut to_skip = filter.offset.unwrap_or(0);
            let mut remaining = filter.limit;

            loop {
                if remaining == Some(0) {
                    break;
                }

                let page = stream_page(&pool, &aggregate_id, &filter, cursor).await;
                let rows = match page {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                if rows.is_empty() {
                    break;
                }

                let fetched = rows.len() as i64;
                for (id, version, request_id, event_type, bytes, height, compressed, ts) in rows {
                    cursor = version;
                    if to_skip > 0 {
                        to_skip -= 1;
                        continue;
                    }
                    if remaining == Some(0) {
                        break;
                    }
                    let item = payload::decode(&bytes, compressed).map(|payload| EventRow {
                        id,
                        version,
                        request_id,
                        event_type,
                        payload,
                        block_height: height,
                        timestamp: ts,
                    });
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                    if let Some(r) = remaining.as_mut() {
                        *r -= 1;
                    }
                }

                if fetched < STREAM_PAGE_SIZE {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Sequential per-aggregate streams, rows tagged with their aggregate id
    async fn stream_events_for_many(
        &self,
        aggregate_ids: &[&str],
        filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<(String, EventRow)>>> {
        for id in aggregate_ids {
            self.registry.get(id)?;
        }

        let pool = self.pool.clone();
        let aggregate_ids: Vec<String> = aggregate_ids.iter().map(|s| s.to_string()).collect();
        let filter = filter.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<StoreResult<(String, EventRow)>>(64);

        tokio::spawn(async move {
            for aggregate_id in aggregate_ids {
                let mut cursor = filter.version_gte.map(|v| v - 1).unwrap_or(0);
                let mut to_skip = filter.offset.unwrap_or(0);
                let mut remaining = filter.limit;

                'aggregate: loop {
                    if remaining == Some(0) {
                        break;
                    }

                    let rows = match stream_page(&pool, &aggregate_id, &filter, cursor).await {
                        Ok(rows) => rows,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    if rows.is_empty() {
                        break;
                    }

                    let fetched = rows.len() as i64;
                    for (id, version, request_id, event_type, bytes, height, compressed, ts) in rows
                    {
                        cursor = version;
                        if to_skip > 0 {
                            to_skip -= 1;
                            continue;
                        }
                        if remaining == Some(0) {
                            break 'aggregate;
                        }
                        let item = payload::decode(&bytes, compressed).map(|payload| {
                            (
                                aggregate_id.clone(),
                                EventRow {
                                    id,
                                    version,
                                    request_id,
                                    event_type,
                                    payload,
                                    block_height: height,
                                    timestamp: ts,
                                },
                            )
                        });
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            return;
                        }
                        if let Some(r) = remaining.as_mut() {
                            *r -= 1;
                        }
                    }

                    if fetched < STREAM_PAGE_SIZE {
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn outbox_watermark(&self) -> i64 {
        self.watermark.load(Ordering::Acquire)
    }

    async fn outbox_pending_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

type StreamRow = (i64, i64, String, String, Vec<u8>, Option<i64>, bool, i64);

/// Fetch one keyset page for the streaming read
async fn stream_page(
    pool: &PgPool,
    aggregate_id: &str,
    filter: &EventFilter,
    cursor: i64,
) -> StoreResult<Vec<StreamRow>> {
    let mut sql = format!(
        r#"SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp FROM "{aggregate_id}" WHERE version > $1"#
    );
    let mut binds: Vec<i64> = vec![cursor];
    let mut n = 2;

    if let Some(v) = filter.version_lte {
        sql.push_str(&format!(" AND version <= ${n}"));
        binds.push(v);
        n += 1;
    }
    if let Some(h) = filter.height_gte {
        sql.push_str(&format!(" AND block_height IS NOT NULL AND block_height >= ${n}"));
        binds.push(h);
        n += 1;
    }
    if let Some(h) = filter.height_lte {
        sql.push_str(&format!(" AND block_height IS NOT NULL AND block_height <= ${n}"));
        binds.push(h);
        n += 1;
    }
    sql.push_str(&format!(" ORDER BY version ASC LIMIT ${n}"));
    binds.push(STREAM_PAGE_SIZE);

    let mut query = sqlx::query_as::<Postgres, StreamRow>(&sql);
    for bind in binds {
        query = query.bind(bind);
    }
    Ok(query.fetch_all(pool).await?)
}

/// `$n` placeholder list starting at position `start`
fn pg_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Chunked outbox delete inside an open transaction
async fn delete_outbox_chunked(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[i64],
) -> StoreResult<()> {
    for chunk in ids.chunks(SERVER_MAX_BIND_PARAMS) {
        let placeholders = pg_placeholders(1, chunk.len());
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
        r#"SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp FROM "{aggregate_id}" WHERE TRUE"#
    );
    let mut binds: Vec<i64> = Vec::new();
    let mut n = 1;

    if let Some(v) = filter.version_gte {
        sql.push_str(&format!(" AND version >= ${n}"));
        binds.push(v);
        n += 1;
    }
    if let Some(v) = filter.version_lte {
        sql.push_str(&format!(" AND version <= ${n}"));
        binds.push(v);
        n += 1;
    }
    if let Some(h) = filter.height_gte {
        sql.push_str(&format!(" AND block_height IS NOT NULL AND block_height >= ${n}"));
        binds.push(h);
        n += 1;
    }
    if let Some(h) = filter.height_lte {
        sql.push_str(&format!(" AND block_height IS NOT NULL AND block_height <= ${n}"));
        binds.push(h);
        n += 1;
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
        sql.push_str(&format!(" LIMIT ${n}"));
        binds.push(filter.limit.unwrap_or(i64::MAX));
        n += 1;
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET ${n}"));
            binds.push(offset);
        }
    }

    (sql, binds)
}
