//! Integration tests for the save protocol

use std::sync::Arc;

use chainstore::{
    shared, AggregateRoot, EngineConfig, EventFilter, ModelCache, SharedModel, StorageAdapter,
    StoreError, WriteService,
};

mod common;

use common::{sqlite_store, TestLedger, TestPublisher};

fn write_service(
    store: Arc<dyn StorageAdapter>,
    publisher: Arc<TestPublisher>,
) -> (WriteService, Arc<ModelCache>) {
    let config = EngineConfig::default();
    let cache = Arc::new(ModelCache::new(config.cache_ttl, config.cache_capacity));
    (
        WriteService::new(store, publisher, cache.clone(), config),
        cache,
    )
}

#[tokio::test]
async fn test_save_fast_path_publishes_and_clears_outbox() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let (service, _cache) = write_service(store.clone(), publisher.clone());

    let mut ledger = TestLedger::new("wallet");
    ledger.deposit(1, Some(1));
    ledger.deposit(2, Some(2));
    let model: SharedModel = shared(ledger);

    service.save_one(&model).await.unwrap();

    // Two rows in the aggregate table, in version order
    let rows = store
        .fetch_events_for_one("wallet", &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].version, 1);
    assert_eq!(rows[1].version, 2);
    assert_eq!(rows[0].payload, r#"{"amount":1}"#);
    assert_eq!(rows[1].payload, r#"{"amount":2}"#);

    // One publish call with both events in order
    let batches = publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0][0].event_version, 1);
    assert_eq!(batches[0][1].event_version, 2);
    assert!(batches[0][0].block_height == 1 && batches[0][1].block_height == 2);

    // Outbox emptied after the ACK delete
    assert_eq!(store.outbox_pending_count().await.unwrap(), 0);

    // Unsaved events were marked saved
    assert!(model.lock().await.unsaved_events().is_empty());
}

#[tokio::test]
async fn test_wire_events_map_absent_height_to_minus_one() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let (service, _cache) = write_service(store.clone(), publisher.clone());

    let mut ledger = TestLedger::new("mempool_wallet");
    ledger.deposit(7, None);
    let model = shared(ledger);

    service.save_one(&model).await.unwrap();

    let delivered = publisher.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].block_height, -1);
    assert_eq!(delivered[0].model_name, "mempool_wallet");
}

#[tokio::test]
async fn test_versions_stay_contiguous_across_saves() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let (service, _cache) = write_service(store.clone(), publisher.clone());

    let mut ledger = TestLedger::new("wallet");
    ledger.deposit(1, Some(1));
    ledger.deposit(2, Some(2));
    ledger.deposit(3, Some(3));
    service.save_one(&shared(ledger)).await.unwrap();

    // Read-modify-write cycle: rehydrate a fresh instance, append, save
    let mut ledger = TestLedger::new("wallet");
    store.restore_exact_state_latest(&mut ledger).await.unwrap();
    assert_eq!(ledger.version(), 3);
    ledger.deposit(4, Some(4));
    ledger.deposit(5, Some(5));
    service.save_one(&shared(ledger)).await.unwrap();

    let rows = store
        .fetch_events_for_one("wallet", &EventFilter::default())
        .await
        .unwrap();
    let versions: Vec<i64> = rows.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_outbox_ids_strictly_increase_across_calls() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);

    let mut first = TestLedger::new("wallet_a");
    first.deposit(1, Some(1));
    first.deposit(2, Some(2));
    let outcome_a = store
        .persist_aggregates_and_outbox(&[shared(first)])
        .await
        .unwrap();

    let mut second = TestLedger::new("wallet_b");
    second.deposit(3, Some(3));
    let outcome_b = store
        .persist_aggregates_and_outbox(&[shared(second)])
        .await
        .unwrap();

    // Ids are strictly increasing within and across calls
    let mut all = outcome_a.inserted_outbox_ids.clone();
    all.extend(&outcome_b.inserted_outbox_ids);
    assert!(all.windows(2).all(|w| w[0] < w[1]));
    assert!(outcome_a.last_id < outcome_b.first_id);
}

#[tokio::test]
async fn test_idempotent_retry_inserts_nothing() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);

    let mut first = TestLedger::new("wallet");
    first.deposit_with_request(10, Some(1), "req-42");
    let outcome = store
        .persist_aggregates_and_outbox(&[shared(first)])
        .await
        .unwrap();
    assert_eq!(outcome.inserted_outbox_ids.len(), 1);

    // Same (version, request_id) again, as after a crashed save retry
    let mut retry = TestLedger::new("wallet");
    retry.deposit_with_request(10, Some(1), "req-42");
    let outcome = store
        .persist_aggregates_and_outbox(&[shared(retry)])
        .await
        .unwrap();

    // Second call inserts zero rows and surfaces no error
    assert!(outcome.inserted_outbox_ids.is_empty());
    assert!(outcome.raw_events.is_empty());

    let rows = store
        .fetch_events_for_one("wallet", &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 1);
}

#[tokio::test]
async fn test_save_rejects_event_without_request_id() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let (service, _cache) = write_service(store.clone(), publisher.clone());

    let mut ledger = TestLedger::new("wallet");
    ledger.push_raw(chainstore::PendingEvent {
        event_type: "Deposited".to_string(),
        request_id: String::new(),
        block_height: Some(1),
        timestamp: chainstore::idgen::now_micros(),
        payload: r#"{"amount":1}"#.to_string(),
    });
    let model = shared(ledger);

    let err = service.save_one(&model).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidEvent(_)));

    // Nothing was persisted and nothing published
    let rows = store
        .fetch_events_for_one("wallet", &EventFilter::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(publisher.delivered_count(), 0);
}

#[tokio::test]
async fn test_snapshot_created_when_aggregate_signals() {
    let (store, _dir) = sqlite_store().await;
    let store: Arc<dyn StorageAdapter> = Arc::new(store);
    let publisher = Arc::new(TestPublisher::new());
    let (service, _cache) = write_service(store.clone(), publisher.clone());

    let mut ledger = TestLedger::new("wallet");
    for height in 1..=4 {
        ledger.deposit(height, Some(height));
    }
    ledger.request_snapshot();
    let model = shared(ledger);

    service.save_one(&model).await.unwrap();

    let snapshot = store.find_latest_snapshot("wallet").await.unwrap().unwrap();
    assert_eq!(snapshot.block_height, 4);
    assert_eq!(snapshot.version, 4);

    // The snapshot request was consumed
    assert!(!model.lock().await.can_make_snapshot());
}
