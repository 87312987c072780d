//! Model cache
//!
//! Bounded TTL cache for rehydrated aggregates. Expired entries fall out
//! on access; when the cache is full, the entry with the lowest hit count
//! is evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::model::SharedModel;

struct CacheEntry {
    model: SharedModel,
    inserted_at: Instant,
    hits: u64,
}

/// TTL + capacity bounded cache of shared aggregate handles
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl ModelCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Look up an aggregate handle, refreshing its hit count
    pub async fn get(&self, aggregate_id: &str) -> Option<SharedModel> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(aggregate_id) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.hits += 1;
                Some(entry.model.clone())
            }
            Some(_) => {
                entries.remove(aggregate_id);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an aggregate handle
    pub async fn put(&self, aggregate_id: String, model: SharedModel) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&aggregate_id) && entries.len() >= self.capacity {
            // Evict the least useful entry
            let coldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.hits)
                .map(|(id, _)| id.clone());
            if let Some(id) = coldest {
                entries.remove(&id);
            }
        }

        entries.insert(
            aggregate_id,
            CacheEntry {
                model,
                inserted_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Drop one aggregate's entry
    pub async fn remove(&self, aggregate_id: &str) {
        self.entries.write().await.remove(aggregate_id);
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache currently holds nothing
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
