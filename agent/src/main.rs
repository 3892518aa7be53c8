//! Chouette shipping agent
//!
//! A host-resident agent that aggregates raw metric samples produced by
//! co-hosted applications into Datadog-shaped data points and ships them
//! (and log records) to the Datadog API. Everything durable lives in a
//! Redis or SQLite backed queue, so no accepted record is lost across
//! restarts or network outages.
// The entry point wires the actors together: it loads configuration from
// the environment, starts the storage actor and the processing actors, and
// schedules periodic ticks to each of them. Shutdown cancels the schedules
// and lets in-flight work drain before the process exits.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::time::Duration;

use anyhow::Result;
use shared::utils::current_timestamp;
use shared::{ChouetteConfig, StorageType};
use tracing::{error, info, warn};

// The agent is organized into several modules, each with a distinct responsibility.
mod aggregator;
mod collector;
mod merger;
mod plugins;
mod scheduler;
mod sender;
mod storage;
mod wrappers;

#[cfg(test)]
mod tests;

use aggregator::{spawn_aggregator, MetricsAggregator};
use collector::{spawn_collector, MetricsCollector};
use scheduler::{Cancellable, Scheduler};
use sender::{spawn_sender, Sender};
use storage::{spawn_storage, RedisEngine, SqliteEngine, StorageEngine};

/// How long shutdown waits for in-flight ticks to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_logging() {
    let log_level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| shared::defaults::default_log_level())
        .to_lowercase();
    // RUST_LOG wins when set; LOG_LEVEL otherwise.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "chouette_agent={level},chouette_shared={level}",
            level = log_level
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}

fn build_engine(config: &ChouetteConfig) -> Result<Box<dyn StorageEngine>> {
    match config.storage_type {
        StorageType::Redis => Ok(Box::new(RedisEngine::new(
            &config.redis_host,
            config.redis_port,
        )?)),
        StorageType::Sqlite => Ok(Box::new(SqliteEngine::new(&config.db_path)?)),
    }
}

/// Delay until the next wall-clock boundary of `interval`, so ticks land
/// on clean second boundaries.
fn aligned_initial_delay(interval: u64) -> Duration {
    let interval = interval as f64;
    Duration::from_secs_f64(interval - (current_timestamp() % interval))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A .env file is honored before the environment is read.
    dotenvy::dotenv().ok();
    init_logging();
    info!("Starting Chouette.");

    let config = match ChouetteConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Invalid configuration: {:#}", error);
            error!("Chouette startup aborted. Fix the environment and try again.");
            std::process::exit(1);
        }
    };

    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(error) => {
            error!(
                "Could not initialize {} storage: {:#}",
                config.storage_type, error
            );
            std::process::exit(1);
        }
    };
    let (storage, mut storage_join) = spawn_storage(engine);

    let (aggregator_handle, mut aggregator_join) =
        spawn_aggregator(MetricsAggregator::new(&config, storage.clone()));

    let metrics_sender = Sender::metrics(&config, storage.clone())?;
    let (metrics_sender_handle, mut metrics_sender_join) = spawn_sender(metrics_sender);

    let logs_sender = Sender::logs(&config, storage.clone())?;
    let (logs_sender_handle, mut logs_sender_join) = spawn_sender(logs_sender);

    let collector_handle = if config.collector_plugins.is_empty() {
        None
    } else {
        let (handle, _collector_join) =
            spawn_collector(MetricsCollector::new(&config, storage.clone()));
        Some(handle)
    };

    // Independent fixed-rate schedules for the three pipelines.
    let mut timers: Vec<Cancellable> = Vec::new();
    timers.push(Scheduler::schedule_at_fixed_rate(
        aligned_initial_delay(config.release_interval),
        Duration::from_secs(config.release_interval),
        {
            let handle = metrics_sender_handle.clone();
            move || {
                let handle = handle.clone();
                async move {
                    handle.tick().await;
                    Ok(())
                }
            }
        },
    ));
    timers.push(Scheduler::schedule_at_fixed_rate(
        aligned_initial_delay(config.release_interval),
        Duration::from_secs(config.release_interval),
        {
            let handle = logs_sender_handle.clone();
            move || {
                let handle = handle.clone();
                async move {
                    handle.tick().await;
                    Ok(())
                }
            }
        },
    ));
    timers.push(Scheduler::schedule_at_fixed_rate(
        aligned_initial_delay(config.aggregate_interval),
        Duration::from_secs(config.aggregate_interval),
        {
            let handle = aggregator_handle.clone();
            move || {
                let handle = handle.clone();
                async move {
                    handle.tick().await;
                    Ok(())
                }
            }
        },
    ));
    if let Some(collector) = &collector_handle {
        timers.push(Scheduler::schedule_at_fixed_rate(
            aligned_initial_delay(config.capture_interval),
            Duration::from_secs(config.capture_interval),
            {
                let handle = collector.clone();
                move || {
                    let handle = handle.clone();
                    async move {
                        handle.tick().await;
                        Ok(())
                    }
                }
            },
        ));
    }
    info!(
        aggregate_interval = config.aggregate_interval,
        release_interval = config.release_interval,
        capture_interval = config.capture_interval,
        storage = %config.storage_type,
        "Chouette is running."
    );

    // Run until a shutdown signal arrives or a vital component dies.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
        _ = &mut storage_join => {
            error!("Storage terminated unexpectedly, aborting.");
            std::process::exit(1);
        }
        _ = &mut aggregator_join => {
            error!("Aggregator terminated unexpectedly, aborting.");
            std::process::exit(1);
        }
        _ = &mut metrics_sender_join => {
            error!("Metrics sender terminated unexpectedly, aborting.");
            std::process::exit(1);
        }
        _ = &mut logs_sender_join => {
            error!("Logs sender terminated unexpectedly, aborting.");
            std::process::exit(1);
        }
    }

    // Stop the schedules first, then close the actor inboxes. Each actor
    // finishes its in-flight message before stopping, and the storage
    // actor stops last, so nothing accepted is lost.
    for timer in &timers {
        timer.cancel();
    }
    drop(timers);
    drop(aggregator_handle);
    drop(metrics_sender_handle);
    drop(logs_sender_handle);
    drop(collector_handle);

    let drain = async {
        let _ = aggregator_join.await;
        let _ = metrics_sender_join.await;
        let _ = logs_sender_join.await;
        drop(storage);
        let _ = storage_join.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!("Shutdown timeout reached with work still in flight.");
    }

    info!("Chouette shutdown complete.");
    Ok(())
}
