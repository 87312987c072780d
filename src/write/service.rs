//! Write Service
//!
//! Drives the save protocol: atomic persistence of events and outbox rows,
//! cache refresh, optional snapshots, then either a fast-path publish of
//! the just-persisted events or a strict ordered drain of the outbox.
//! Failed drains are retried in the background with exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::model::{SharedModel, SnapshotRetention};
use crate::read::cache::ModelCache;
use crate::store::{BatchPublisher, StorageAdapter, StoreResult};

/// Write-side orchestrator
pub struct WriteService {
    store: Arc<dyn StorageAdapter>,
    publisher: Arc<dyn BatchPublisher>,
    cache: Arc<ModelCache>,
    config: EngineConfig,
    retry_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WriteService {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        publisher: Arc<dyn BatchPublisher>,
        cache: Arc<ModelCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            cache,
            config,
            retry_task: StdMutex::new(None),
        }
    }

    /// Save a single aggregate
    pub async fn save_one(&self, model: &SharedModel) -> StoreResult<()> {
        self.save(std::slice::from_ref(model)).await
    }

    /// Save one or more aggregates.
    ///
    /// Events are durably stored before this returns; on success they are
    /// either already published or enqueued for the next drain. A delivery
    /// failure surfaces to the caller after the backoff timer is armed.
    pub async fn save(&self, models: &[SharedModel]) -> StoreResult<()> {
        let persisted = self.store.persist_aggregates_and_outbox(models).await?;

        for model in models {
            let mut guard = model.lock().await;
            let aggregate_id = guard.aggregate_id().to_string();

            if guard.can_make_snapshot() {
                let retention = self.effective_retention(guard.snapshot_retention());
                self.store.create_snapshot(guard.as_mut(), retention).await?;
            }
            drop(guard);

            self.cache.put(aggregate_id, model.clone()).await;
        }

        if persisted.inserted_outbox_ids.is_empty() {
            // Idempotent retry or nothing to save
            return Ok(());
        }

        // Fast path only when the outbox holds nothing but this call's rows.
        // Anything older than our first id, or any row beyond our own batch
        // still pending past the watermark, must go through an ordered drain.
        let backlog = self
            .store
            .has_backlog_before(persisted.first_ts, persisted.first_id)
            .await?;
        let foreign_pending = !backlog
            && self.store.has_pending_after_watermark().await?
            && self.store.outbox_pending_count().await?
                > persisted.inserted_outbox_ids.len() as i64;

        let publish_result = if backlog || foreign_pending {
            self.strict_drain().await
        } else {
            self.fast_path(&persisted.raw_events, &persisted.inserted_outbox_ids)
                .await
        };

        if let Err(e) = publish_result {
            tracing::warn!(error = %e, "publish failed after save, scheduling retry drains");
            self.arm_retry_timer();
            return Err(e);
        }

        Ok(())
    }

    /// Roll all given aggregates back to the pivot height.
    ///
    /// Aggregates also present in `models_to_save` are not rehydrated; they
    /// carry the replacement state and are saved at the end.
    pub async fn rollback(
        &self,
        models: &[SharedModel],
        block_height: i64,
        models_to_save: &[SharedModel],
    ) -> StoreResult<()> {
        let mut aggregate_ids = Vec::with_capacity(models.len());
        for model in models {
            aggregate_ids.push(model.lock().await.aggregate_id().to_string());
        }

        for id in &aggregate_ids {
            self.cache.remove(id).await;
        }

        let ids: Vec<&str> = aggregate_ids.iter().map(String::as_str).collect();
        self.store.rollback_aggregates(&ids, block_height).await?;

        let mut slated = HashSet::new();
        for model in models_to_save {
            slated.insert(model.lock().await.aggregate_id().to_string());
        }

        for model in models {
            let mut guard = model.lock().await;
            if slated.contains(guard.aggregate_id()) {
                continue;
            }
            self.store
                .restore_exact_state_at_height(guard.as_mut(), block_height)
                .await?;
            let aggregate_id = guard.aggregate_id().to_string();
            drop(guard);
            self.cache.put(aggregate_id, model.clone()).await;
        }

        if !models_to_save.is_empty() {
            self.save(models_to_save).await?;
        }

        Ok(())
    }

    /// Stop background retry drains. Called on engine teardown.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.retry_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Publish just-persisted events directly, then ACK-delete them by id
    async fn fast_path(
        &self,
        raw_events: &[crate::model::WireEvent],
        inserted_ids: &[i64],
    ) -> StoreResult<()> {
        self.publisher
            .publish_batch_with_ack(raw_events.to_vec())
            .await?;
        self.store.delete_outbox_by_ids(inserted_ids).await?;
        tracing::debug!(events = raw_events.len(), "fast-path publish acked");
        Ok(())
    }

    /// Drain the outbox to empty in ordered, byte-budgeted chunks
    async fn strict_drain(&self) -> StoreResult<()> {
        drain_outbox(
            self.store.as_ref(),
            self.publisher.as_ref(),
            self.config.transport_max_frame_bytes,
        )
        .await
    }

    /// Arm the exponential-backoff retry timer unless one is already running
    fn arm_retry_timer(&self) {
        let Ok(mut slot) = self.retry_task.lock() else {
            return;
        };
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let cap = self.config.transport_max_frame_bytes;
        let base = self.config.retry_base_delay;
        let max = self.config.retry_max_delay;

        *slot = Some(tokio::spawn(async move {
            let mut delay = base;
            loop {
                tokio::time::sleep(delay).await;
                match drain_outbox(store.as_ref(), publisher.as_ref(), cap).await {
                    Ok(()) => {
                        tracing::info!("outbox drained after retry");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "retry drain failed");
                        delay = (delay * 2).min(max);
                    }
                }
            }
        }));
    }

    /// Aggregate-declared retention, with the service defaults as fallback
    fn effective_retention(&self, declared: SnapshotRetention) -> SnapshotRetention {
        if declared == SnapshotRetention::default() {
            SnapshotRetention {
                min_keep: self.config.snapshot_min_keep,
                keep_window: self.config.snapshot_keep_window,
            }
        } else {
            declared
        }
    }
}

impl Drop for WriteService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run drain chunks until the outbox reports empty
async fn drain_outbox(
    store: &dyn StorageAdapter,
    publisher: &dyn BatchPublisher,
    transport_cap_bytes: u64,
) -> StoreResult<()> {
    loop {
        let delivered = store
            .fetch_deliver_ack_chunk(transport_cap_bytes, publisher)
            .await?;
        if delivered == 0 {
            return Ok(());
        }
    }
}
