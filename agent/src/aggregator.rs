//! Metrics aggregation actor
//!
//! On every tick the aggregator turns the raw metrics queue into wire-ready
//! wrapped metrics: it cleans up outdated raw records, buckets the
//! remaining keys by flush interval, merges each bucket by identity, runs
//! the configured wrapper and stores the result into the wrapped queue.
//!
//! Raw records are only deleted after the wrapped records they produced
//! were confirmed stored. A failed store aborts the bucket and leaves its
//! raw records in place for the next tick (at-least-once). All storage
//! interaction is done with blocking asks, and the actor handles one tick
//! at a time, so a long catch-up after downtime cannot interleave with the
//! next tick and duplicate metrics.

use shared::ChouetteConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::merger;
use crate::storage::{self, Queue, StorageHandle};
use crate::wrappers::{wrapper_for, MetricsWrapper};

/// Capacity of the aggregator's tick inbox. Ticks arriving while one is
/// being processed queue up behind it.
const INBOX_CAPACITY: usize = 8;

pub struct MetricsAggregator {
    storage: StorageHandle,
    flush_interval: u64,
    ttl: u64,
    wrapper: Option<Box<dyn MetricsWrapper>>,
}

impl MetricsAggregator {
    pub fn new(config: &ChouetteConfig, storage: StorageHandle) -> Self {
        let wrapper = wrapper_for(&config.metrics_wrapper, config);
        if wrapper.is_none() {
            warn!(
                "No metrics wrapper configured. Raw metrics won't be aggregated, only cleaned up."
            );
        }
        Self {
            storage,
            flush_interval: config.aggregate_interval,
            ttl: config.metric_ttl,
            wrapper,
        }
    }

    /// One aggregation pass over the raw metrics queue. Returns whether
    /// every bucket was stored and cleaned up successfully.
    pub async fn aggregate(&self) -> bool {
        debug!("Cleaning up outdated raw metrics.");
        self.storage
            .cleanup_outdated(Queue::METRICS_RAW, self.ttl)
            .await;

        let Some(wrapper) = self.wrapper.as_deref() else {
            return true;
        };

        let keys_and_ts = self.storage.collect_keys(Queue::METRICS_RAW, 0).await;
        let grouped_keys = merger::group_metric_keys(&keys_and_ts, self.flush_interval);
        if !keys_and_ts.is_empty() {
            info!(
                "Separated {} metric keys into {} groups of {} seconds.",
                keys_and_ts.len(),
                grouped_keys.len(),
                self.flush_interval
            );
        }

        let mut all_processed = true;
        for bucket_keys in grouped_keys {
            all_processed &= self.process_bucket(wrapper, bucket_keys).await;
        }
        all_processed
    }

    /// Processes a single flush bucket: fetch, merge, wrap, store wrapped,
    /// delete raw.
    async fn process_bucket(&self, wrapper: &dyn MetricsWrapper, keys: Vec<String>) -> bool {
        let payloads = self
            .storage
            .collect_values(Queue::METRICS_RAW, keys.clone())
            .await;
        let merged = merger::merge_metrics(&payloads, self.flush_interval);
        let wrapped = wrapper.wrap_metrics(merged);
        debug!(
            "Wrapped {} raw metrics into {} data points.",
            payloads.len(),
            wrapped.len()
        );

        let wrapped_count = wrapped.len();
        let stored = self
            .storage
            .store_records(Queue::METRICS_WRAPPED, storage::storable(wrapped))
            .await;
        if !stored {
            warn!(
                "Could not store {} wrapped metrics. Raw metrics are not cleaned.",
                wrapped_count
            );
            return false;
        }

        let cleaned_up = self
            .storage
            .delete_records(Queue::METRICS_RAW, keys)
            .await;
        if !cleaned_up {
            warn!("Wrapped metrics were stored, but raw metrics were not cleaned up. Metrics can be duplicated!");
        }
        cleaned_up
    }
}

/// Cloneable handle delivering ticks to the aggregator actor.
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<()>,
}

impl AggregatorHandle {
    pub async fn tick(&self) {
        if self.sender.send(()).await.is_err() {
            warn!("Aggregator actor is gone, dropping a tick.");
        }
    }
}

/// Starts the aggregator actor and returns its handle.
pub fn spawn_aggregator(aggregator: MetricsAggregator) -> (AggregatorHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel(INBOX_CAPACITY);
    let join_handle = tokio::spawn(async move {
        while receiver.recv().await.is_some() {
            aggregator.aggregate().await;
        }
        debug!("Aggregator inbox closed, stopping.");
    });
    (AggregatorHandle { sender }, join_handle)
}
