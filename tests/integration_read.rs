//! Integration tests for rehydration, filtered reads and retention

use std::sync::Arc;

use chainstore::{
    shared, AggregateRoot, EngineConfig, EventFilter, ModelCache, OrderBy, OrderDir, ReadService,
    SnapshotRetention, StorageAdapter, StoreError, WriteService,
};

mod common;

use common::{sqlite_store, TestLedger, TestPublisher};

async fn seeded_store(heights: std::ops::RangeInclusive<i64>) -> (Arc<dyn StorageAdapter>, tempfile::TempDir) {
    let (store, dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let config = EngineConfig::default();
    let cache = Arc::new(ModelCache::new(config.cache_ttl, config.cache_capacity));
    let service = WriteService::new(store.clone(), publisher, cache, config);

    let mut ledger = TestLedger::new("wallet");
    for height in heights {
        ledger.deposit(height * 10, Some(height));
    }
    service.save_one(&shared(ledger)).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn test_get_one_caches_rehydrated_model() {
    let (store, _dir) = seeded_store(1..=6).await;
    let cache = Arc::new(ModelCache::new(
        std::time::Duration::from_secs(60),
        100,
    ));
    let read = ReadService::new(store, cache);

    let first = read.get_one(shared(TestLedger::new("wallet"))).await.unwrap();
    {
        let guard = first.lock().await;
        assert_eq!(guard.version(), 6);
        assert_eq!(guard.last_block_height(), Some(6));
    }

    // Second read hits the cache and returns the same handle
    let second = read.get_one(shared(TestLedger::new("wallet"))).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_get_one_by_height_is_point_in_time() {
    let (store, _dir) = seeded_store(1..=6).await;
    let cache = Arc::new(ModelCache::new(std::time::Duration::from_secs(60), 100));
    let read = ReadService::new(store, cache);

    let model = read
        .get_one_by_height(shared(TestLedger::new("wallet")), 4)
        .await
        .unwrap();
    let guard = model.lock().await;
    assert_eq!(guard.version(), 4);
    assert_eq!(guard.last_block_height(), Some(4));
}

#[tokio::test]
async fn test_rehydration_uses_snapshot_plus_trailing_events() {
    let (store, _dir) = seeded_store(1..=8).await;

    // Snapshot at height 5
    let mut at_five = TestLedger::new("wallet");
    store
        .restore_exact_state_at_height(&mut at_five, 5)
        .await
        .unwrap();
    let expected_at_five = at_five.total();
    store
        .create_snapshot(&mut at_five, SnapshotRetention::default())
        .await
        .unwrap();

    // Remove all events at or below the snapshot; the tail plus the
    // snapshot must still reconstruct the full state
    store.prune_events_below("wallet", 6).await.unwrap();
    let remaining = store
        .fetch_events_for_one("wallet", &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 3);

    let mut rebuilt = TestLedger::new("wallet");
    store.restore_exact_state_latest(&mut rebuilt).await.unwrap();
    assert_eq!(rebuilt.version(), 8);
    assert_eq!(
        rebuilt.total(),
        expected_at_five + 60 + 70 + 80,
        "snapshot state plus pruned tail must equal the full ledger"
    );
}

#[tokio::test]
async fn test_filtered_reads() {
    let (store, _dir) = seeded_store(1..=10).await;

    let filter = EventFilter {
        version_gte: Some(3),
        version_lte: Some(7),
        ..EventFilter::default()
    };
    let rows = store.fetch_events_for_one("wallet", &filter).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].version, 3);
    assert_eq!(rows[4].version, 7);

    let filter = EventFilter {
        height_gte: Some(8),
        ..EventFilter::default()
    };
    let rows = store.fetch_events_for_one("wallet", &filter).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.block_height.unwrap() >= 8));

    let filter = EventFilter {
        order_by: OrderBy::Version,
        order_dir: OrderDir::Desc,
        limit: Some(2),
        offset: Some(1),
        ..EventFilter::default()
    };
    let rows = store.fetch_events_for_one("wallet", &filter).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].version, 9);
    assert_eq!(rows[1].version, 8);

    // Payloads come back as JSON strings, unparsed
    assert_eq!(rows[0].payload, r#"{"amount":90}"#);
}

#[tokio::test]
async fn test_fetch_events_for_many() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);

    for name in ["wallet_a", "wallet_b"] {
        let mut ledger = TestLedger::new(name);
        ledger.deposit(1, Some(1));
        ledger.deposit(2, Some(2));
        store
            .persist_aggregates_and_outbox(&[shared(ledger)])
            .await
            .unwrap();
    }

    let result = store
        .fetch_events_for_many(&["wallet_a", "wallet_b"], &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].0, "wallet_a");
    assert_eq!(result[0].1.len(), 2);
    assert_eq!(result[1].0, "wallet_b");
    assert_eq!(result[1].1.len(), 2);
}

#[tokio::test]
async fn test_model_view_by_height() {
    let (store, _dir) = seeded_store(1..=6).await;
    let cache = Arc::new(ModelCache::new(std::time::Duration::from_secs(60), 100));
    let read = ReadService::new(store, cache);

    let view = read
        .get_one_model_by_height_read(shared(TestLedger::new("wallet")), 3)
        .await
        .unwrap();
    assert_eq!(view.aggregate_id, "wallet");
    assert_eq!(view.version, 3);
    assert_eq!(view.block_height, 3);

    let state: serde_json::Value = serde_json::from_str(&view.payload).unwrap();
    assert_eq!(state["total"].as_i64().unwrap(), 10 + 20 + 30);
}

#[tokio::test]
async fn test_streaming_unsupported_on_embedded_store() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    store.ensure_schema(&["wallet"]).await.unwrap();

    let err = store
        .stream_events_for_one("wallet", &EventFilter::default())
        .await
        .err()
        .expect("embedded store must refuse to stream");
    assert!(matches!(err, StoreError::Unsupported(_)));

    let err = store
        .stream_events_for_many(&["wallet"], &EventFilter::default())
        .await
        .err()
        .expect("embedded store must refuse to stream");
    assert!(matches!(err, StoreError::Unsupported(_)));
}

#[tokio::test]
async fn test_snapshot_retention_keeps_min_and_window() {
    let (store, _dir) = seeded_store(1..=10).await;

    // Snapshots at heights 2, 4, 6, 8, 10
    for height in [2, 4, 6, 8, 10] {
        let mut at = TestLedger::new("wallet");
        store.restore_exact_state_at_height(&mut at, height).await.unwrap();
        store
            .create_snapshot(&mut at, SnapshotRetention::default())
            .await
            .unwrap();
    }

    // min_keep 2, window 3: keep {8, 10} plus anything at height >= 7
    store
        .prune_old_snapshots(
            "wallet",
            10,
            SnapshotRetention {
                min_keep: 2,
                keep_window: 3,
            },
        )
        .await
        .unwrap();

    let mut remaining = Vec::new();
    let mut cursor = i64::MAX;
    while let Some(snap) = store
        .find_latest_snapshot_before_height("wallet", cursor)
        .await
        .unwrap()
    {
        remaining.push(snap.block_height);
        cursor = snap.block_height - 1;
    }
    assert_eq!(remaining, vec![10, 8]);
}

#[tokio::test]
async fn test_snapshot_conflict_is_swallowed() {
    let (store, _dir) = seeded_store(1..=4).await;

    let mut at_four = TestLedger::new("wallet");
    store.restore_exact_state_at_height(&mut at_four, 4).await.unwrap();
    store
        .create_snapshot(&mut at_four, SnapshotRetention::default())
        .await
        .unwrap();

    // Same (aggregate_id, block_height) again: a successful no-op
    store
        .create_snapshot(&mut at_four, SnapshotRetention::default())
        .await
        .unwrap();

    let snap = store.find_latest_snapshot("wallet").await.unwrap().unwrap();
    assert_eq!(snap.block_height, 4);
}
