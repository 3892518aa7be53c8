//! Stats collection actor
//!
//! On every tick the collector fans a `StatsRequest` out to its configured
//! plugins. Plugins answer asynchronously with `StatsResponse` messages
//! that land in the same inbox as the ticks; every received batch is
//! persisted straight into the wrapped metrics queue. No response means no
//! update, and the next tick simply asks again. Plugins are never awaited,
//! so a stuck plugin cannot stall collection.

use std::collections::HashMap;

use shared::ChouetteConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::plugins::{
    spawn_plugin, HostStatsCollector, PluginHandle, QueuesStatsCollector, StatsResponse,
};
use crate::storage::{self, Queue, StorageHandle};

const INBOX_CAPACITY: usize = 64;

/// Message union of the collector inbox.
pub enum CollectorMessage {
    Tick,
    Stats(StatsResponse),
}

/// Resolves a configured plugin name to a started worker. Unknown names
/// resolve to absent; so do plugins that fail to initialize.
fn start_plugin(name: &str, config: &ChouetteConfig) -> Option<PluginHandle> {
    match name {
        "host" => Some(spawn_plugin(HostStatsCollector::new())),
        "queues" => match QueuesStatsCollector::new(
            &config.redis_host,
            config.redis_port,
            &config.queues_pattern,
        ) {
            Ok(collector) => Some(spawn_plugin(collector)),
            Err(error) => {
                warn!("Could not start plugin 'queues': {:#}", error);
                None
            }
        },
        unknown => {
            warn!("Unknown collector plugin '{}', skipping.", unknown);
            None
        }
    }
}

pub struct MetricsCollector {
    storage: StorageHandle,
    config: ChouetteConfig,
    plugin_names: Vec<String>,
    /// Started plugin singletons, looked up or created on each tick.
    plugins: HashMap<String, PluginHandle>,
}

impl MetricsCollector {
    pub fn new(config: &ChouetteConfig, storage: StorageHandle) -> Self {
        info!(
            "Configured collection plugins are: '{}'.",
            config.collector_plugins.join("', '")
        );
        Self {
            storage,
            config: config.clone(),
            plugin_names: config.collector_plugins.clone(),
            plugins: HashMap::new(),
        }
    }

    async fn handle(
        &mut self,
        message: CollectorMessage,
        self_sender: &mpsc::WeakSender<CollectorMessage>,
    ) {
        match message {
            CollectorMessage::Tick => {
                // The reply address is upgraded per tick; holding a strong
                // sender here would keep the inbox open forever.
                let Some(reply_to) = self_sender.upgrade() else {
                    return;
                };
                for name in self.plugin_names.clone() {
                    let plugin = match self.plugins.get(&name) {
                        Some(plugin) => plugin.clone(),
                        None => match start_plugin(&name, &self.config) {
                            Some(plugin) => {
                                self.plugins.insert(name.clone(), plugin.clone());
                                plugin
                            }
                            None => continue,
                        },
                    };
                    debug!("Requesting stats from '{}'.", plugin.name());
                    plugin.request_stats(reply_to.clone()).await;
                }
            }
            CollectorMessage::Stats(response) => {
                info!("Storing collected stats from '{}'.", response.producer);
                self.storage
                    .tell_store_records(Queue::METRICS_WRAPPED, storage::storable(response.stats))
                    .await;
            }
        }
    }
}

/// Cloneable handle delivering ticks to the collector actor.
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorMessage>,
}

impl CollectorHandle {
    pub async fn tick(&self) {
        if self.sender.send(CollectorMessage::Tick).await.is_err() {
            warn!("Collector actor is gone, dropping a tick.");
        }
    }
}

/// Starts the collector actor and returns its handle.
pub fn spawn_collector(mut collector: MetricsCollector) -> (CollectorHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel(INBOX_CAPACITY);
    let self_sender = sender.downgrade();
    let join_handle = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            collector.handle(message, &self_sender).await;
        }
        debug!("Collector inbox closed, stopping.");
    });
    (CollectorHandle { sender }, join_handle)
}
