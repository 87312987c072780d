//! Read Service
//!
//! Rehydrates aggregates to their latest state or to a past height, and
//! exposes filtered event-range reads. Latest-state reads go through the
//! shared model cache; point-in-time reads always hit storage.

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::model::{EventRow, ModelView, SharedModel, SnapshotRow};
use crate::read::cache::ModelCache;
use crate::store::{EventFilter, StorageAdapter, StoreResult};

/// Cached read façade
pub struct ReadService {
    store: Arc<dyn StorageAdapter>,
    cache: Arc<ModelCache>,
}

impl ReadService {
    pub fn new(store: Arc<dyn StorageAdapter>, cache: Arc<ModelCache>) -> Self {
        Self { store, cache }
    }

    /// Get an aggregate at its latest state.
    ///
    /// A cache hit returns the cached handle directly; on a miss the given
    /// model is rehydrated from its latest snapshot plus trailing events
    /// and cached.
    pub async fn get_one(&self, model: SharedModel) -> StoreResult<SharedModel> {
        let aggregate_id = model.lock().await.aggregate_id().to_string();

        if let Some(cached) = self.cache.get(&aggregate_id).await {
            return Ok(cached);
        }

        {
            let mut guard = model.lock().await;
            self.store.restore_exact_state_latest(guard.as_mut()).await?;
        }
        self.cache.put(aggregate_id, model.clone()).await;
        Ok(model)
    }

    /// Get several aggregates at their latest state
    pub async fn get_many(&self, models: Vec<SharedModel>) -> StoreResult<Vec<SharedModel>> {
        let mut out = Vec::with_capacity(models.len());
        for model in models {
            out.push(self.get_one(model).await?);
        }
        Ok(out)
    }

    /// Rehydrate an aggregate to its exact state at a past height.
    ///
    /// Point-in-time state is never cached.
    pub async fn get_one_by_height(
        &self,
        model: SharedModel,
        block_height: i64,
    ) -> StoreResult<SharedModel> {
        {
            let mut guard = model.lock().await;
            self.store
                .restore_exact_state_at_height(guard.as_mut(), block_height)
                .await?;
        }
        Ok(model)
    }

    /// Filtered event range for one aggregate; payloads stay JSON strings
    pub async fn fetch_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<Vec<EventRow>> {
        self.store.fetch_events_for_one(aggregate_id, filter).await
    }

    /// Filtered event ranges for several aggregates
    pub async fn fetch_events_for_many(
        &self,
        aggregate_ids: &[&str],
        filter: &EventFilter,
    ) -> StoreResult<Vec<(String, Vec<EventRow>)>> {
        self.store.fetch_events_for_many(aggregate_ids, filter).await
    }

    /// Stream a filtered event range (server store only)
    pub async fn stream_events_for_one(
        &self,
        aggregate_id: &str,
        filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<EventRow>>> {
        self.store.stream_events_for_one(aggregate_id, filter).await
    }

    /// Stream filtered event ranges for several aggregates (server store only)
    pub async fn stream_events_for_many(
        &self,
        aggregate_ids: &[&str],
        filter: &EventFilter,
    ) -> StoreResult<BoxStream<'static, StoreResult<(String, EventRow)>>> {
        self.store.stream_events_for_many(aggregate_ids, filter).await
    }

    /// Point-in-time view of one aggregate as a read row
    pub async fn get_one_model_by_height_read(
        &self,
        model: SharedModel,
        block_height: i64,
    ) -> StoreResult<ModelView> {
        let mut guard = model.lock().await;
        self.store
            .get_one_model_by_height_read(guard.as_mut(), block_height)
            .await
    }

    /// Point-in-time views of several aggregates as read rows
    pub async fn get_many_models_by_height_read(
        &self,
        models: &[SharedModel],
        block_height: i64,
    ) -> StoreResult<Vec<ModelView>> {
        self.store
            .get_many_models_by_height_read(models, block_height)
            .await
    }

    /// Latest snapshot row for an aggregate
    pub async fn find_latest_snapshot(
        &self,
        aggregate_id: &str,
    ) -> StoreResult<Option<SnapshotRow>> {
        self.store.find_latest_snapshot(aggregate_id).await
    }

    /// Latest snapshot row at or below a height
    pub async fn find_latest_snapshot_before_height(
        &self,
        aggregate_id: &str,
        block_height: i64,
    ) -> StoreResult<Option<SnapshotRow>> {
        self.store
            .find_latest_snapshot_before_height(aggregate_id, block_height)
            .await
    }
}
