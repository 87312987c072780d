//! In-memory store
//!
//! The SQL engine lives entirely in memory (a single-connection sqlite
//! `:memory:` pool sharing the embedded store's statements). Durability is
//! explicit: after every committed write the whole database image is
//! flushed to a [`DurableMedium`], and on open a previously flushed image
//! is re-imported. The medium itself stays outside the engine; a
//! file-backed implementation ships here, browser-persistent KV works the
//! same way.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::model::{
    AggregateRoot, EventRow, SharedModel, SnapshotRetention, SnapshotRow,
};

use super::error::{StoreError, StoreResult};
use super::sqlite::{OutboxRollback, SqliteCore};
use super::{
    BatchPublisher, EventFilter, PersistOutcome, ReplayOptions, StorageAdapter,
};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Durable substrate for the in-memory store's database image
#[async_trait]
pub trait DurableMedium: Send + Sync {
    /// Replace the stored image with `image`
    async fn store_image(&self, image: &[u8]) -> std::io::Result<()>;

    /// Load the stored image, `None` when nothing was flushed yet
    async fn load_image(&self) -> std::io::Result<Option<Vec<u8>>>;
}

/// File-backed durable medium
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DurableMedium for FileMedium {
    async fn store_image(&self, image: &[u8]) -> std::io::Result<()> {
        let staged = self.path.with_extension("tmp");
        tokio::fs::write(&staged, image).await?;
        tokio::fs::rename(&staged, &self.path).await
    }

    async fn load_image(&self) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-memory store with explicit durable-image persistence
pub struct MemoryStore {
    core: SqliteCore,
    medium: Option<Arc<dyn DurableMedium>>,
    staging: PathBuf,
}

impl MemoryStore {
    /// Open an ephemeral store with no durable medium
    pub async fn open() -> StoreResult<Self> {
        let pool = connect_memory().await?;
        let core = SqliteCore::new(pool, false);
        core.ensure_base_schema().await?;
        Ok(Self {
            core,
            medium: None,
            staging: staging_path(),
        })
    }

    /// Open a store backed by a durable medium, importing any image it holds
    pub async fn with_durable(medium: Arc<dyn DurableMedium>) -> StoreResult<Self> {
        let pool = connect_memory().await?;
        let core = SqliteCore::new(pool, false);
        let staging = staging_path();

        if let Some(image) = medium.load_image().await.map_err(StoreError::Durable)? {
            import_image(&core, &staging, &image).await?;
            tracing::info!(bytes = image.len(), "restored database image from durable medium");
        }
        core.ensure_base_schema().await?;

        Ok(Self {
            core,
            medium: Some(medium),
            staging,
        })
    }

    /// Flush the whole database image to the durable medium
    pub async fn flush_to_durable(&self) -> StoreResult<()> {
        let Some(medium) = &self.medium else {
            return Ok(());
        };

        // VACUUM INTO refuses to overwrite, stage a fresh file every time
        let _ = tokio::fs::remove_file(&self.staging).await;
        let sql = format!("VACUUM INTO '{}'", escape_path(&self.staging));
        sqlx::query(&sql).execute(self.core.pool()).await?;

        let image = tokio::fs::read(&self.staging)
            .await
            .map_err(StoreError::Durable)?;
        let _ = tokio::fs::remove_file(&self.staging).await;

        medium.store_image(&image).await.map_err(StoreError::Durable)?;
        tracing::debug!(bytes = image.len(), "flushed database image to durable medium");
        Ok(())
    }
}

async fn connect_memory() -> StoreResult<SqlitePool> {
    let options: SqliteConnectOptions = "sqlite::memory:".parse()?;

    // A ::memory: database lives and dies with its connection; the pool
    // must hold exactly one and never recycle it.
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn staging_path() -> PathBuf {
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "chainstore-image-{}-{}.db",
        std::process::id(),
        n
    ))
}

fn escape_path(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

/// Import a flushed image into the empty in-memory database
async fn import_image(core: &SqliteCore, staging: &Path, image: &[u8]) -> StoreResult<()> {
    tokio::fs::write(staging, image)
        .await
        .map_err(StoreError::Durable)?;

    let pool = core.pool();
    let attach = format!("ATTACH DATABASE '{}' AS img", escape_path(staging));
    sqlx::query(&attach).execute(pool).await?;

    let result = copy_attached(pool).await;

    sqlx::query("DETACH DATABASE img").execute(pool).await?;
    let _ = tokio::fs::remove_file(staging).await;
    result
}

async fn copy_attached(pool: &SqlitePool) -> StoreResult<()> {
    let objects: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT type, name, sql FROM img.sqlite_master
        WHERE name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
        ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END
        "#,
    )
    .fetch_all(pool)
    .await?;

    // Tables first, then their rows, then indexes and triggers so the
    // integrity guards do not re-fire on already-guarded rows.
    for (_, _, sql) in objects.iter().filter(|(ty, _, _)| ty.as_str() == "table") {
        sqlx::query(sql).execute(pool).await?;
    }
    for (_, name, _) in objects.iter().filter(|(ty, _, _)| ty.as_str() == "table") {
        let copy = format!(r#"INSERT INTO main."{name}" SELECT * FROM img."{name}""#);
        sqlx::query(&copy).execute(pool).await?;
    }
    for (_, _, sql) in objects.iter().filter(|(ty, _, _)| ty.as_str() != "table") {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn ensure_schema(&self, aggregate_ids: &[&str]) -> StoreResult<()> {
        self.core.ensure_schema(aggregate_ids).await
    }

    async fn persist_aggregates_and_outbox(
        &self,
        models: &[SharedModel],
    ) -> StoreResult<PersistOutcome> {
        let outcome = self.core.persist(models).await?;
        self.flush_to_durable().await?;
        Ok(outcome)
    }

    async fn delete_outbox_by_ids(&self, ids: &[i64]) -> StoreResult<()> {
        self.core.delete_outbox_by_ids(ids).await?;
        self.flush_to_durable().await
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
        let delivered = self
            .core
            .fetch_deliver_ack_chunk(transport_cap_bytes, publisher)
            .await?;
        if delivered > 0 {
            self.flush_to_durable().await?;
        }
        Ok(delivered)
    }

    async fn rollback_aggregates(
        &self,
        aggregate_ids: &[&str],
        block_height: i64,
    ) -> StoreResult<()> {
        self.core
            .rollback(aggregate_ids, block_height, OutboxRollback::Clear)
            .await?;
        self.flush_to_durable().await
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
        self.core.create_snapshot(model, retention).await?;
        self.flush_to_durable().await
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
            .await?;
        self.flush_to_durable().await
    }

    async fn prune_events_below(&self, aggregate_id: &str, block_height: i64) -> StoreResult<()> {
        self.core.prune_events_below(aggregate_id, block_height).await?;
        self.flush_to_durable().await
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
