//! Collector plugin contract
//!
//! Plugins are singleton workers sampling some statistic source into
//! wire-ready WrappedMetrics. The collector talks to them exclusively with
//! fire-and-forget messages: a `StatsRequest` carries the address to reply
//! to, and the plugin answers with a `StatsResponse` when its sampling is
//! done. If the collector is gone by then, the response is dropped
//! silently and the next tick starts over.

// Plugin implementations
mod host;
mod queues;

pub use host::HostStatsCollector;
pub use queues::QueuesStatsCollector;

use shared::WrappedMetric;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::collector::CollectorMessage;

const INBOX_CAPACITY: usize = 8;

/// Collector -> plugin: produce stats and send them back to `reply_to`.
pub struct StatsRequest {
    pub reply_to: mpsc::Sender<CollectorMessage>,
}

/// Plugin -> collector: a finite batch of sampled metrics.
pub struct StatsResponse {
    pub producer: &'static str,
    pub stats: Vec<WrappedMetric>,
}

/// The sampling routine a plugin runs on every stats request.
///
/// Implementations may block (reading /proc, talking to a local broker);
/// each plugin runs on its own blocking task.
pub trait StatsCollector: Send + 'static {
    fn name(&self) -> &'static str;
    fn collect_stats(&mut self) -> anyhow::Result<Vec<WrappedMetric>>;
}

/// Address of a running plugin.
#[derive(Clone)]
pub struct PluginHandle {
    name: &'static str,
    sender: mpsc::Sender<StatsRequest>,
}

impl PluginHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Asks the plugin for stats, fire-and-forget. The response arrives
    /// asynchronously on `reply_to`, or never.
    pub async fn request_stats(&self, reply_to: mpsc::Sender<CollectorMessage>) {
        if self.sender.send(StatsRequest { reply_to }).await.is_err() {
            warn!("Plugin '{}' is gone, dropping a stats request.", self.name);
        }
    }
}

/// Starts a plugin worker and returns its address.
///
/// A failing collection is logged and the worker keeps serving requests;
/// the collector simply sees no response for that round.
pub fn spawn_plugin<C: StatsCollector>(mut collector: C) -> PluginHandle {
    let name = collector.name();
    let (sender, mut receiver) = mpsc::channel::<StatsRequest>(INBOX_CAPACITY);
    tokio::task::spawn_blocking(move || {
        while let Some(request) = receiver.blocking_recv() {
            match collector.collect_stats() {
                Ok(stats) => {
                    let response = StatsResponse {
                        producer: name,
                        stats,
                    };
                    if request
                        .reply_to
                        .blocking_send(CollectorMessage::Stats(response))
                        .is_err()
                    {
                        debug!("[{}] Requester is stopped. Dropping stats.", name);
                    }
                }
                Err(error) => {
                    warn!("[{}] Stats collection failed: {:#}", name, error);
                }
            }
        }
        debug!("[{}] Plugin inbox closed, stopping.", name);
    });
    PluginHandle { name, sender }
}
