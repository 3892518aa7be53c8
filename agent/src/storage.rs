//! Durable queue storage for the agent
//!
//! All durable state lives behind a single storage actor that owns the only
//! connection to the backing store (Redis or SQLite). Records are addressed
//! by queue: `(data type, kind)` where kind separates producer-submitted
//! `raw` records from ready-to-ship `wrapped` ones. Every record is a
//! `(key, timestamp, payload)` triple; the key is a fresh UUID generated at
//! insert.
//!
//! Components talk to the actor through a `StorageHandle`. The aggregator
//! and the senders use the ask pattern (await the reply) because their
//! correctness depends on operation order; the collector stores plugin
//! results fire-and-forget.

// Storage engine implementations
mod redis_engine;
mod sqlite_engine;

pub use redis_engine::RedisEngine;
pub use sqlite_engine::SqliteEngine;

use std::fmt;

use shared::QueueRecord;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of the storage actor's inbox.
const INBOX_CAPACITY: usize = 1024;

/// What kind of payloads a queue holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Metrics,
    Logs,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Metrics => write!(f, "metrics"),
            DataType::Logs => write!(f, "logs"),
        }
    }
}

/// Processing stage of the records in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Raw,
    Wrapped,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Raw => write!(f, "raw"),
            RecordKind::Wrapped => write!(f, "wrapped"),
        }
    }
}

/// Logical queue address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Queue {
    pub data_type: DataType,
    pub kind: RecordKind,
}

impl Queue {
    pub const METRICS_RAW: Queue = Queue {
        data_type: DataType::Metrics,
        kind: RecordKind::Raw,
    };
    pub const METRICS_WRAPPED: Queue = Queue {
        data_type: DataType::Metrics,
        kind: RecordKind::Wrapped,
    };
    pub const LOGS_RAW: Queue = Queue {
        data_type: DataType::Logs,
        kind: RecordKind::Raw,
    };
    pub const LOGS_WRAPPED: Queue = Queue {
        data_type: DataType::Logs,
        kind: RecordKind::Wrapped,
    };

    /// Every queue the storage layer materializes.
    pub const ALL: [Queue; 4] = [
        Queue::METRICS_RAW,
        Queue::METRICS_WRAPPED,
        Queue::LOGS_RAW,
        Queue::LOGS_WRAPPED,
    ];

    /// SQLite table holding this queue.
    pub fn table_name(&self) -> String {
        format!("{}_{}", self.data_type, self.kind)
    }

    /// Redis sorted set indexing record keys by timestamp.
    pub fn keys_set(&self) -> String {
        format!("chouette:{}:{}.keys", self.data_type, self.kind)
    }

    /// Redis hash mapping record keys to payloads.
    pub fn values_hash(&self) -> String {
        format!("chouette:{}:{}.values", self.data_type, self.kind)
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.data_type, self.kind)
    }
}

/// A record serialized for storage, not yet keyed.
#[derive(Debug, Clone)]
pub struct StorableRecord {
    pub timestamp: f64,
    pub payload: String,
}

/// A record with its queue key assigned, as handed to an engine.
#[derive(Debug, Clone)]
pub struct KeyedRecord {
    pub key: String,
    pub timestamp: f64,
    pub payload: String,
}

/// Serializes records for storage, skipping any record whose payload cannot
/// be rendered as JSON.
pub fn storable<R: QueueRecord>(records: impl IntoIterator<Item = R>) -> Vec<StorableRecord> {
    records
        .into_iter()
        .filter_map(|record| match record.payload_json() {
            Ok(payload) => Some(StorableRecord {
                timestamp: record.queue_timestamp(),
                payload,
            }),
            Err(error) => {
                warn!("Skipping a record that failed to serialize: {}", error);
                None
            }
        })
        .collect()
}

/// Synchronous interface every backing store implements.
///
/// Engines are driven one request at a time by the storage actor, so they
/// can hold a plain connection without interior locking. Multi-structure
/// mutations must be atomic (one transaction or pipeline).
pub trait StorageEngine: Send {
    fn store_records(&mut self, queue: Queue, records: &[KeyedRecord]) -> anyhow::Result<()>;
    /// Keys with their timestamps, oldest first. `amount` of 0 means all.
    fn collect_keys(&mut self, queue: Queue, amount: usize)
        -> anyhow::Result<Vec<(String, f64)>>;
    /// Payloads in submission order of `keys`; missing keys are skipped.
    fn collect_values(&mut self, queue: Queue, keys: &[String]) -> anyhow::Result<Vec<String>>;
    fn delete_records(&mut self, queue: Queue, keys: &[String]) -> anyhow::Result<()>;
    /// Removes records older than `now - ttl`. Returns how many were removed.
    fn cleanup_outdated(&mut self, queue: Queue, ttl: u64) -> anyhow::Result<usize>;
    fn queue_size(&mut self, queue: Queue) -> anyhow::Result<i64>;
}

enum StorageRequest {
    StoreRecords {
        queue: Queue,
        records: Vec<StorableRecord>,
        reply: Option<oneshot::Sender<bool>>,
    },
    CollectKeys {
        queue: Queue,
        amount: usize,
        reply: oneshot::Sender<Vec<(String, f64)>>,
    },
    CollectValues {
        queue: Queue,
        keys: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    DeleteRecords {
        queue: Queue,
        keys: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    CleanupOutdated {
        queue: Queue,
        ttl: u64,
        reply: oneshot::Sender<bool>,
    },
    GetQueueSize {
        queue: Queue,
        reply: oneshot::Sender<i64>,
    },
}

/// Cloneable handle to the storage actor.
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageRequest>,
}

impl StorageHandle {
    /// Stores records into a queue and waits for confirmation. An empty
    /// batch succeeds without touching the store.
    pub async fn store_records(&self, queue: Queue, records: Vec<StorableRecord>) -> bool {
        if records.is_empty() {
            return true;
        }
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::StoreRecords {
            queue,
            records,
            reply: Some(reply),
        };
        if self.sender.send(request).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Stores records without waiting for the result. Used by the collector,
    /// which tolerates a lost batch (the next capture replaces it).
    pub async fn tell_store_records(&self, queue: Queue, records: Vec<StorableRecord>) {
        if records.is_empty() {
            return;
        }
        let request = StorageRequest::StoreRecords {
            queue,
            records,
            reply: None,
        };
        if self.sender.send(request).await.is_err() {
            warn!("Storage actor is gone, dropping a record batch.");
        }
    }

    /// Collects up to `amount` keys with their timestamps, oldest first.
    /// `amount` of 0 collects all keys. Returns an empty list on error.
    pub async fn collect_keys(&self, queue: Queue, amount: usize) -> Vec<(String, f64)> {
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::CollectKeys {
            queue,
            amount,
            reply,
        };
        if self.sender.send(request).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Collects payloads for `keys` in submission order, skipping missing
    /// ones. Returns an empty list on error.
    pub async fn collect_values(&self, queue: Queue, keys: Vec<String>) -> Vec<String> {
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::CollectValues { queue, keys, reply };
        if self.sender.send(request).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Deletes records by key. An empty key list is a successful no-op.
    pub async fn delete_records(&self, queue: Queue, keys: Vec<String>) -> bool {
        if keys.is_empty() {
            return true;
        }
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::DeleteRecords { queue, keys, reply };
        if self.sender.send(request).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Removes records older than `now - ttl` seconds from a queue.
    pub async fn cleanup_outdated(&self, queue: Queue, ttl: u64) -> bool {
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::CleanupOutdated { queue, ttl, reply };
        if self.sender.send(request).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Current number of records in a queue, or -1 on error.
    pub async fn queue_size(&self, queue: Queue) -> i64 {
        let (reply, response) = oneshot::channel();
        let request = StorageRequest::GetQueueSize { queue, reply };
        if self.sender.send(request).await.is_err() {
            return -1;
        }
        response.await.unwrap_or(-1)
    }
}

/// Starts the storage actor on a blocking task and returns its handle.
///
/// The actor drains its inbox one request at a time, which gives every
/// queue total per-queue operation ordering for free.
pub fn spawn_storage(engine: Box<dyn StorageEngine>) -> (StorageHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel(INBOX_CAPACITY);
    let join_handle = tokio::task::spawn_blocking(move || {
        let mut engine = engine;
        while let Some(request) = receiver.blocking_recv() {
            handle_request(engine.as_mut(), request);
        }
        debug!("Storage actor inbox closed, stopping.");
    });
    (StorageHandle { sender }, join_handle)
}

fn handle_request(engine: &mut dyn StorageEngine, request: StorageRequest) {
    match request {
        StorageRequest::StoreRecords {
            queue,
            records,
            reply,
        } => {
            let keyed: Vec<KeyedRecord> = records
                .into_iter()
                .map(|record| KeyedRecord {
                    key: Uuid::new_v4().to_string(),
                    timestamp: record.timestamp,
                    payload: record.payload,
                })
                .collect();
            let result = match engine.store_records(queue, &keyed) {
                Ok(()) => {
                    debug!("Stored {} records to queue '{}'.", keyed.len(), queue);
                    true
                }
                Err(error) => {
                    warn!("Could not store records to queue '{}': {:#}", queue, error);
                    false
                }
            };
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        StorageRequest::CollectKeys {
            queue,
            amount,
            reply,
        } => {
            let keys = match engine.collect_keys(queue, amount) {
                Ok(keys) => keys,
                Err(error) => {
                    warn!("Could not collect keys from queue '{}': {:#}", queue, error);
                    Vec::new()
                }
            };
            let _ = reply.send(keys);
        }
        StorageRequest::CollectValues { queue, keys, reply } => {
            let values = match engine.collect_values(queue, &keys) {
                Ok(values) => values,
                Err(error) => {
                    warn!("Could not collect values from queue '{}': {:#}", queue, error);
                    Vec::new()
                }
            };
            let _ = reply.send(values);
        }
        StorageRequest::DeleteRecords { queue, keys, reply } => {
            let result = match engine.delete_records(queue, &keys) {
                Ok(()) => true,
                Err(error) => {
                    warn!(
                        "Could not delete {} records from queue '{}': {:#}",
                        keys.len(),
                        queue,
                        error
                    );
                    false
                }
            };
            let _ = reply.send(result);
        }
        StorageRequest::CleanupOutdated { queue, ttl, reply } => {
            let result = match engine.cleanup_outdated(queue, ttl) {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(
                            "Cleaned {} outdated records from queue '{}'.",
                            removed, queue
                        );
                    }
                    true
                }
                Err(error) => {
                    warn!(
                        "Could not cleanup outdated records in queue '{}': {:#}",
                        queue, error
                    );
                    false
                }
            };
            let _ = reply.send(result);
        }
        StorageRequest::GetQueueSize { queue, reply } => {
            let size = match engine.queue_size(queue) {
                Ok(size) => size,
                Err(error) => {
                    warn!("Could not read size of queue '{}': {:#}", queue, error);
                    -1
                }
            };
            let _ = reply.send(size);
        }
    }
}
