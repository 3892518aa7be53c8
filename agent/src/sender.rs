//! Dispatch of wrapped records to the Datadog API
//!
//! Two sender instances run in the agent: one draining the wrapped metrics
//! queue into `v1/series` and one draining the wrapped logs queue into
//! `v1/input`. They share the whole dispatch flow and differ only in the
//! queue, the endpoint, the request envelope and how global tags are merged
//! into a record; a `DispatchProfile` captures those differences.
//!
//! Records are deleted only after the API accepted the request (status 200
//! or 202). Any transport failure or rejection leaves the queue untouched,
//! and the next tick retries with the oldest records first.

use std::io::Write;

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use shared::{ChouetteConfig, RawMetric};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::storage::{self, Queue, StorageHandle};

const INBOX_CAPACITY: usize = 8;

/// The parts of the dispatch flow that differ between metrics and logs.
pub trait DispatchProfile: Send + Sync {
    /// Queue this sender drains.
    fn queue(&self) -> Queue;
    /// Label used in logs and self-telemetry metric names.
    fn label(&self) -> &'static str;
    /// API endpoint path under the configured base URL.
    fn endpoint(&self) -> &'static str;
    /// Parses a stored payload and merges global tags and the host name
    /// into it. Unparsable payloads yield None and are skipped.
    fn prepare(&self, payload: &str, global_tags: &[String], host: Option<&str>) -> Option<Value>;
    /// Wraps the prepared records into the request body.
    fn envelope(&self, records: Vec<Value>) -> Value;
    /// Name of the queue-size gauge emitted before each dispatch, if this
    /// profile has one. Only the metrics sender reports its backlog.
    fn queued_gauge(&self) -> Option<&'static str> {
        None
    }
}

/// Metrics dispatch: tags stay a list, body is a `series` object.
pub struct MetricsDispatch;

impl DispatchProfile for MetricsDispatch {
    fn queue(&self) -> Queue {
        Queue::METRICS_WRAPPED
    }

    fn label(&self) -> &'static str {
        "metrics"
    }

    fn endpoint(&self) -> &'static str {
        "v1/series"
    }

    fn prepare(&self, payload: &str, global_tags: &[String], host: Option<&str>) -> Option<Value> {
        let mut record: Value = serde_json::from_str(payload).ok()?;
        let object = record.as_object_mut()?;
        let mut tags = object
            .get("tags")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        tags.extend(global_tags.iter().map(|tag| Value::from(tag.as_str())));
        object.insert("tags".to_string(), Value::from(tags));
        if let Some(host) = host {
            object.insert("host".to_string(), Value::from(host));
        }
        Some(record)
    }

    fn envelope(&self, records: Vec<Value>) -> Value {
        serde_json::json!({ "series": records })
    }

    fn queued_gauge(&self) -> Option<&'static str> {
        Some("chouette.queued.metrics")
    }
}

/// Logs dispatch: `ddtags` collapse into one comma-separated string, body
/// is a bare list of records.
pub struct LogsDispatch;

impl DispatchProfile for LogsDispatch {
    fn queue(&self) -> Queue {
        Queue::LOGS_WRAPPED
    }

    fn label(&self) -> &'static str {
        "logs"
    }

    fn endpoint(&self) -> &'static str {
        "v1/input"
    }

    fn prepare(&self, payload: &str, global_tags: &[String], host: Option<&str>) -> Option<Value> {
        let mut record: Value = serde_json::from_str(payload).ok()?;
        let object = record.as_object_mut()?;
        let mut tags: Vec<String> = object
            .get("ddtags")
            .and_then(Value::as_array)
            .map(|existing| {
                existing
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        tags.extend(global_tags.iter().cloned());
        object.insert("ddtags".to_string(), Value::from(tags.join(",")));
        if let Some(host) = host {
            object.insert("host".to_string(), Value::from(host));
        }
        Some(record)
    }

    fn envelope(&self, records: Vec<Value>) -> Value {
        Value::Array(records)
    }
}

/// Sender actor state: drains one wrapped queue into the Datadog API.
pub struct Sender {
    profile: Box<dyn DispatchProfile>,
    storage: StorageHandle,
    client: reqwest::Client,
    url: String,
    api_key: String,
    global_tags: Vec<String>,
    host: Option<String>,
    bulk_size: usize,
    ttl: u64,
    send_self_metrics: bool,
}

impl Sender {
    /// The metrics sender: wrapped metrics queue into `{DATADOG_URL}/v1/series`.
    pub fn metrics(config: &ChouetteConfig, storage: StorageHandle) -> Result<Self> {
        Self::build(
            Box::new(MetricsDispatch),
            &config.datadog_url,
            config.metrics_bulk_size,
            config.metric_ttl,
            config,
            storage,
        )
    }

    /// The logs sender: wrapped logs queue into `{DATADOG_LOGS_URL}/v1/input`.
    pub fn logs(config: &ChouetteConfig, storage: StorageHandle) -> Result<Self> {
        Self::build(
            Box::new(LogsDispatch),
            &config.datadog_logs_url,
            config.logs_bulk_size,
            config.log_ttl,
            config,
            storage,
        )
    }

    fn build(
        profile: Box<dyn DispatchProfile>,
        base_url: &str,
        bulk_size: usize,
        ttl: u64,
        config: &ChouetteConfig,
        storage: StorageHandle,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.dispatch_timeout())
            .build()
            .context("Failed to create HTTP client")?;
        let url = format!("{}/{}", base_url.trim_end_matches('/'), profile.endpoint());
        Ok(Self {
            profile,
            storage,
            client,
            url,
            api_key: config.api_key.clone(),
            global_tags: config.global_tags.clone(),
            host: config.host.clone(),
            bulk_size,
            ttl,
            send_self_metrics: config.send_self_metrics,
        })
    }

    /// One dispatch pass. Returns whether data was dispatched and cleaned
    /// up successfully; an empty queue counts as success.
    pub async fn dispatch(&self) -> bool {
        let queue = self.profile.queue();
        let label = self.profile.label();

        debug!("[{}] Cleaning up outdated records.", label);
        self.storage.cleanup_outdated(queue, self.ttl).await;

        let keys: Vec<String> = self
            .storage
            .collect_keys(queue, self.bulk_size)
            .await
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        if keys.is_empty() {
            debug!("[{}] Nothing to dispatch.", label);
            return true;
        }

        let payloads = self.storage.collect_values(queue, keys.clone()).await;
        let records: Vec<Value> = payloads
            .iter()
            .filter_map(|payload| {
                self.profile
                    .prepare(payload, &self.global_tags, self.host.as_deref())
            })
            .collect();

        if self.send_self_metrics {
            if let Some(gauge_name) = self.profile.queued_gauge() {
                self.report_queue_size(queue, gauge_name).await;
            }
        }

        let records_count = records.len();
        let body = self.profile.envelope(records);
        let encoded = match serde_json::to_vec(&body) {
            Ok(encoded) => encoded,
            Err(error) => {
                error!("[{}] Could not encode the request body: {}", label, error);
                return false;
            }
        };
        let compressed = match compress(&encoded) {
            Ok(compressed) => compressed,
            Err(error) => {
                error!("[{}] Could not compress the request body: {}", label, error);
                return false;
            }
        };
        let message_size = compressed.len();
        info!(
            "[{}] Dispatching {} records. Sending around {} KBs of data.",
            label,
            records_count,
            message_size / 1024
        );

        if !self.post(compressed, label).await {
            warn!("[{}] Records were neither dispatched, nor cleaned.", label);
            return false;
        }

        let cleaned_up = self.storage.delete_records(queue, keys).await;
        if !cleaned_up {
            error!("[{}] Records were dispatched, but not cleaned up!", label);
        }

        if self.send_self_metrics {
            self.send_dispatch_telemetry(label, records_count, message_size)
                .await;
        }

        cleaned_up
    }

    async fn post(&self, body: Vec<u8>, label: &str) -> bool {
        let response = self
            .client
            .post(&self.url)
            .query(&[("api_key", self.api_key.as_str())])
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "deflate")
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if matches!(status, 200 | 202) {
                    return true;
                }
                let text = response.text().await.unwrap_or_default();
                error!(
                    "[{}] Unexpected response from Datadog: {}: {}",
                    label, status, text
                );
                false
            }
            Err(error) => {
                error!(
                    "[{}] Could not dispatch records due to an HTTP error: {}",
                    label, error
                );
                false
            }
        }
    }

    /// Emits a gauge with the size of the wrapped queue as observed before
    /// this dispatch, through the raw metrics pipeline.
    async fn report_queue_size(&self, queue: Queue, gauge_name: &str) {
        let size = self.storage.queue_size(queue).await;
        if size < 0 {
            return;
        }
        let gauge = RawMetric::gauge(gauge_name, size as f64);
        self.storage
            .tell_store_records(Queue::METRICS_RAW, storage::storable(vec![gauge]))
            .await;
    }

    async fn send_dispatch_telemetry(&self, label: &str, records: usize, bytes: usize) {
        let self_metrics = vec![
            RawMetric::count(
                format!("chouette.dispatched.{}.number", label),
                records as f64,
            ),
            RawMetric::count(format!("chouette.dispatched.{}.bytes", label), bytes as f64),
        ];
        self.storage
            .tell_store_records(Queue::METRICS_RAW, storage::storable(self_metrics))
            .await;
    }
}

/// DEFLATE (zlib) compression at the default level, the encoding the
/// Datadog intake expects alongside `Content-Encoding: deflate`.
fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Cloneable handle delivering ticks to a sender actor.
#[derive(Clone)]
pub struct SenderHandle {
    sender: mpsc::Sender<()>,
}

impl SenderHandle {
    pub async fn tick(&self) {
        if self.sender.send(()).await.is_err() {
            warn!("Sender actor is gone, dropping a tick.");
        }
    }
}

/// Starts a sender actor and returns its handle.
pub fn spawn_sender(sender: Sender) -> (SenderHandle, JoinHandle<()>) {
    let (tick_sender, mut receiver) = mpsc::channel(INBOX_CAPACITY);
    let join_handle = tokio::spawn(async move {
        while receiver.recv().await.is_some() {
            sender.dispatch().await;
        }
        debug!("Sender inbox closed, stopping.");
    });
    (
        SenderHandle {
            sender: tick_sender,
        },
        join_handle,
    )
}
