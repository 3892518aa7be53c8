//! Tests for the storage actor and the SQLite engine

use shared::utils::current_timestamp;
use shared::{RawMetric, WrappedMetric};
use tempfile::TempDir;

use crate::storage::{
    self, spawn_storage, KeyedRecord, Queue, SqliteEngine, StorageEngine, StorageHandle,
};

fn sqlite_engine(dir: &TempDir) -> SqliteEngine {
    SqliteEngine::new(dir.path().join("chouette.sqlite")).unwrap()
}

fn keyed(key: &str, timestamp: f64, payload: &str) -> KeyedRecord {
    KeyedRecord {
        key: key.to_string(),
        timestamp,
        payload: payload.to_string(),
    }
}

#[test]
fn stored_records_come_back_oldest_first() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);

    engine
        .store_records(
            Queue::METRICS_RAW,
            &[
                keyed("newer", 20.0, "b"),
                keyed("older", 10.0, "a"),
                keyed("newest", 30.0, "c"),
            ],
        )
        .unwrap();

    let keys = engine.collect_keys(Queue::METRICS_RAW, 0).unwrap();
    assert_eq!(
        keys,
        vec![
            ("older".to_string(), 10.0),
            ("newer".to_string(), 20.0),
            ("newest".to_string(), 30.0),
        ]
    );

    let limited = engine.collect_keys(Queue::METRICS_RAW, 2).unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].0, "older");
}

#[test]
fn values_preserve_submission_order_and_skip_missing() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);

    engine
        .store_records(
            Queue::METRICS_RAW,
            &[keyed("a", 1.0, "payload-a"), keyed("b", 2.0, "payload-b")],
        )
        .unwrap();

    let values = engine
        .collect_values(
            Queue::METRICS_RAW,
            &[
                "b".to_string(),
                "missing".to_string(),
                "a".to_string(),
            ],
        )
        .unwrap();
    assert_eq!(values, vec!["payload-b".to_string(), "payload-a".to_string()]);
}

#[test]
fn delete_removes_only_the_given_keys() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);

    engine
        .store_records(
            Queue::METRICS_RAW,
            &[keyed("a", 1.0, "a"), keyed("b", 2.0, "b")],
        )
        .unwrap();
    engine
        .delete_records(Queue::METRICS_RAW, &["a".to_string()])
        .unwrap();

    assert_eq!(engine.queue_size(Queue::METRICS_RAW).unwrap(), 1);
    let keys = engine.collect_keys(Queue::METRICS_RAW, 0).unwrap();
    assert_eq!(keys[0].0, "b");
}

#[test]
fn cleanup_removes_outdated_records_only() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);
    let now = current_timestamp();

    engine
        .store_records(
            Queue::METRICS_WRAPPED,
            &[
                keyed("outdated", now - 20_000.0, "old"),
                keyed("fresh", now - 100.0, "new"),
            ],
        )
        .unwrap();

    let removed = engine.cleanup_outdated(Queue::METRICS_WRAPPED, 14_400).unwrap();
    assert_eq!(removed, 1);

    let keys = engine.collect_keys(Queue::METRICS_WRAPPED, 0).unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].0, "fresh");
}

#[test]
fn queues_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);

    engine
        .store_records(Queue::METRICS_RAW, &[keyed("a", 1.0, "a")])
        .unwrap();
    assert_eq!(engine.queue_size(Queue::METRICS_RAW).unwrap(), 1);
    assert_eq!(engine.queue_size(Queue::METRICS_WRAPPED).unwrap(), 0);
    assert_eq!(engine.queue_size(Queue::LOGS_WRAPPED).unwrap(), 0);
}

#[test]
fn duplicate_keys_fail_the_whole_batch() {
    let dir = TempDir::new().unwrap();
    let mut engine = sqlite_engine(&dir);

    engine
        .store_records(Queue::METRICS_RAW, &[keyed("a", 1.0, "a")])
        .unwrap();
    let result = engine.store_records(
        Queue::METRICS_RAW,
        &[keyed("b", 2.0, "b"), keyed("a", 3.0, "dup")],
    );
    assert!(result.is_err());
    // The transaction rolled back: "b" must not exist either.
    assert_eq!(engine.queue_size(Queue::METRICS_RAW).unwrap(), 1);
}

/// Spawns a storage actor backed by a fresh SQLite file.
pub fn sqlite_storage(dir: &TempDir) -> StorageHandle {
    let engine = sqlite_engine(dir);
    let (handle, _join) = spawn_storage(Box::new(engine));
    handle
}

#[tokio::test]
async fn actor_assigns_fresh_keys_and_roundtrips_records() {
    let dir = TempDir::new().unwrap();
    let handle = sqlite_storage(&dir);

    let metric = WrappedMetric::new(
        "metric-test",
        "count",
        Some(100.0),
        3.0,
        vec!["test:test".to_string()],
        Some(10),
    );
    assert!(
        handle
            .store_records(Queue::METRICS_WRAPPED, storage::storable(vec![metric]))
            .await
    );

    let keys = handle.collect_keys(Queue::METRICS_WRAPPED, 0).await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, 100.0);
    assert!(!keys[0].0.is_empty());

    let values = handle
        .collect_values(Queue::METRICS_WRAPPED, vec![keys[0].0.clone()])
        .await;
    assert_eq!(values.len(), 1);
    assert!(values[0].contains("\"metric\":\"metric-test\""));

    assert!(
        handle
            .delete_records(Queue::METRICS_WRAPPED, vec![keys[0].0.clone()])
            .await
    );
    assert_eq!(handle.queue_size(Queue::METRICS_WRAPPED).await, 0);
}

#[tokio::test]
async fn actor_treats_empty_batches_as_success() {
    let dir = TempDir::new().unwrap();
    let handle = sqlite_storage(&dir);

    assert!(handle.store_records(Queue::METRICS_RAW, Vec::new()).await);
    assert!(handle.delete_records(Queue::METRICS_RAW, Vec::new()).await);
    assert!(handle.cleanup_outdated(Queue::METRICS_RAW, 14_400).await);
}

#[tokio::test]
async fn raw_metrics_survive_the_trip_through_the_actor() {
    let dir = TempDir::new().unwrap();
    let handle = sqlite_storage(&dir);

    let gauge = RawMetric::gauge("chouette.queued.metrics", 42.0);
    handle
        .tell_store_records(Queue::METRICS_RAW, storage::storable(vec![gauge]))
        .await;

    // The tell is fire-and-forget; a follow-up ask on the same queue is
    // ordered behind it.
    let keys = handle.collect_keys(Queue::METRICS_RAW, 0).await;
    assert_eq!(keys.len(), 1);
}
