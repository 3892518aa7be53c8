//! Tests for the dispatch pipeline
//!
//! The Datadog endpoint is mocked with httpmock; the queue sits in a
//! temporary SQLite file. Records must only ever disappear from the queue
//! after the endpoint accepted them.

use std::collections::HashMap;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use shared::utils::current_timestamp;
use shared::{ChouetteConfig, WrappedMetric};
use tempfile::TempDir;

use super::storage_tests::sqlite_storage;
use crate::sender::{DispatchProfile, LogsDispatch, MetricsDispatch, Sender};
use crate::storage::{self, Queue};

fn config(server: &MockServer, extra: &[(&str, &str)]) -> ChouetteConfig {
    let mut vars: HashMap<String, String> = [
        ("API_KEY", "dd-key"),
        ("GLOBAL_TAGS", r#"["host:pytest"]"#),
        ("HOST", "test_host"),
        ("SEND_SELF_METRICS", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("DATADOG_URL".to_string(), server.base_url());
    vars.insert("DATADOG_LOGS_URL".to_string(), server.base_url());
    for (key, value) in extra {
        vars.insert(key.to_string(), value.to_string());
    }
    ChouetteConfig::from_vars(&vars).unwrap()
}

fn wrapped(metric: &str, timestamp: f64) -> WrappedMetric {
    WrappedMetric::new(
        metric,
        "count",
        Some(timestamp),
        3.0,
        vec!["test:test".to_string()],
        Some(10),
    )
}

#[tokio::test]
async fn accepted_dispatch_empties_the_queue() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/series")
                .query_param("api_key", "dd-key")
                .header("Content-Encoding", "deflate");
            then.status(202);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::METRICS_WRAPPED,
            storage::storable(vec![wrapped("metric-test", current_timestamp() - 7200.0)]),
        )
        .await;

    let sender = Sender::metrics(&config(&server, &[]), storage.clone()).unwrap();
    assert!(sender.dispatch().await);

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(storage.queue_size(Queue::METRICS_WRAPPED).await, 0);
}

#[tokio::test]
async fn rejected_dispatch_keeps_the_records() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/series");
            then.status(403);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::METRICS_WRAPPED,
            storage::storable(vec![wrapped("metric-test", current_timestamp() - 60.0)]),
        )
        .await;

    let sender = Sender::metrics(&config(&server, &[]), storage.clone()).unwrap();
    assert!(!sender.dispatch().await);

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(storage.queue_size(Queue::METRICS_WRAPPED).await, 1);
}

#[tokio::test]
async fn bulk_size_dispatches_the_oldest_records_first() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/series");
            then.status(202);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    let now = current_timestamp();
    let timestamps: Vec<f64> = (0..5).map(|index| now - 50.0 + index as f64).collect();
    let metrics: Vec<WrappedMetric> = timestamps
        .iter()
        .enumerate()
        .map(|(index, timestamp)| wrapped(&format!("metric-{}", index), *timestamp))
        .collect();
    storage
        .store_records(Queue::METRICS_WRAPPED, storage::storable(metrics))
        .await;

    let sender = Sender::metrics(
        &config(&server, &[("METRICS_BULK_SIZE", "3")]),
        storage.clone(),
    )
    .unwrap();
    assert!(sender.dispatch().await);

    // The three oldest were shipped; the two newest remain.
    let remaining = storage.collect_keys(Queue::METRICS_WRAPPED, 0).await;
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].1, timestamps[3]);
    assert_eq!(remaining[1].1, timestamps[4]);
}

#[tokio::test]
async fn outdated_records_are_cleaned_instead_of_dispatched() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/series");
            then.status(202);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::METRICS_WRAPPED,
            storage::storable(vec![wrapped("ancient", current_timestamp() - 20_000.0)]),
        )
        .await;

    let sender = Sender::metrics(&config(&server, &[]), storage.clone()).unwrap();
    assert!(sender.dispatch().await);

    assert_eq!(mock.hits_async().await, 0);
    assert_eq!(storage.queue_size(Queue::METRICS_WRAPPED).await, 0);
}

#[tokio::test]
async fn timed_out_dispatch_is_a_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/series");
            then.status(202).delay(Duration::from_millis(2500));
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::METRICS_WRAPPED,
            storage::storable(vec![wrapped("metric-test", current_timestamp() - 60.0)]),
        )
        .await;

    // RELEASE_INTERVAL of one second caps the request timeout at a second.
    let sender = Sender::metrics(
        &config(&server, &[("RELEASE_INTERVAL", "1")]),
        storage.clone(),
    )
    .unwrap();
    assert!(!sender.dispatch().await);
    assert_eq!(storage.queue_size(Queue::METRICS_WRAPPED).await, 1);
}

#[tokio::test]
async fn successful_dispatch_emits_self_telemetry() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/series");
            then.status(202);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::METRICS_WRAPPED,
            storage::storable(vec![wrapped("metric-test", current_timestamp() - 60.0)]),
        )
        .await;

    let sender = Sender::metrics(
        &config(&server, &[("SEND_SELF_METRICS", "true")]),
        storage.clone(),
    )
    .unwrap();
    assert!(sender.dispatch().await);

    // One queued-size gauge plus the two dispatched counters.
    let keys: Vec<String> = storage
        .collect_keys(Queue::METRICS_RAW, 0)
        .await
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let raw = storage.collect_values(Queue::METRICS_RAW, keys).await;
    assert_eq!(raw.len(), 3);
    assert!(raw.iter().any(|payload| payload.contains("chouette.queued.metrics")));
    assert!(raw
        .iter()
        .any(|payload| payload.contains("chouette.dispatched.metrics.number")));
    assert!(raw
        .iter()
        .any(|payload| payload.contains("chouette.dispatched.metrics.bytes")));
}

#[tokio::test]
async fn logs_dispatch_emits_no_queued_gauge() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/input");
            then.status(202);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let storage = sqlite_storage(&dir);
    storage
        .store_records(
            Queue::LOGS_WRAPPED,
            vec![crate::storage::StorableRecord {
                timestamp: current_timestamp() - 60.0,
                payload: r#"{"date":"2020-01-01T00:00:00+00:00","message":{"text":"hi"},"level":"INFO","ddsource":"app","service":"svc"}"#.to_string(),
            }],
        )
        .await;

    let sender = Sender::logs(
        &config(&server, &[("SEND_SELF_METRICS", "true")]),
        storage.clone(),
    )
    .unwrap();
    assert!(sender.dispatch().await);

    // Only the two dispatched counters, no queued-size gauge.
    let keys: Vec<String> = storage
        .collect_keys(Queue::METRICS_RAW, 0)
        .await
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let raw = storage.collect_values(Queue::METRICS_RAW, keys).await;
    assert_eq!(raw.len(), 2);
    assert!(raw.iter().all(|payload| !payload.contains("chouette.queued")));
    assert!(raw
        .iter()
        .any(|payload| payload.contains("chouette.dispatched.logs.number")));
}

#[test]
fn metrics_records_get_global_tags_and_host() {
    let payload =
        r#"{"metric":"metric-test","tags":["test:test"],"points":[[100.0,3.0]],"type":"count","interval":10}"#;
    let prepared = MetricsDispatch
        .prepare(payload, &["host:pytest".to_string()], Some("test_host"))
        .unwrap();
    assert_eq!(prepared["tags"], json!(["test:test", "host:pytest"]));
    assert_eq!(prepared["host"], "test_host");

    let body = MetricsDispatch.envelope(vec![prepared]);
    assert_eq!(body["series"][0]["metric"], "metric-test");
    assert_eq!(body["series"][0]["points"], json!([[100.0, 3.0]]));
}

#[test]
fn log_records_get_comma_joined_ddtags_and_host() {
    let payload = r#"{"date":"2020-01-01T00:00:00+00:00","message":{"text":"hi"},"level":"INFO","ddsource":"app","service":"svc","ddtags":["env:prod"]}"#;
    let prepared = LogsDispatch
        .prepare(payload, &["host:pytest".to_string()], Some("test_host"))
        .unwrap();
    assert_eq!(prepared["ddtags"], "env:prod,host:pytest");
    assert_eq!(prepared["host"], "test_host");

    let body = LogsDispatch.envelope(vec![prepared.clone()]);
    assert_eq!(body, json!([prepared]));
}

#[test]
fn unparsable_payloads_are_skipped() {
    assert!(MetricsDispatch.prepare("not json", &[], None).is_none());
    assert!(LogsDispatch.prepare("not json", &[], None).is_none());
}
