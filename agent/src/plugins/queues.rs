//! Task-queue statistics plugin
//!
//! Samples the sizes of Redis hashes matching a configurable key pattern.
//! The default pattern covers Dramatiq's broker layout (`dramatiq:*.msgs`),
//! which makes queue depths of a co-hosted task-queue visible in Datadog.
//! The plugin owns its own Redis connection; it monitors a broker, not the
//! agent's storage.

use anyhow::{Context, Result};
use redis::Commands;
use shared::utils::current_timestamp;
use shared::WrappedMetric;

use super::StatsCollector;

pub struct QueuesStatsCollector {
    client: redis::Client,
    connection: Option<redis::Connection>,
    pattern: String,
    /// Static prefix and suffix of the pattern, stripped from key names
    /// to form the `queue` tag.
    prefix: String,
    suffix: String,
}

impl QueuesStatsCollector {
    pub fn new(host: &str, port: u16, pattern: &str) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("Invalid Redis URL {}", url))?;
        let (prefix, suffix) = match pattern.split_once('*') {
            Some((prefix, suffix)) => (prefix.to_string(), suffix.to_string()),
            None => (String::new(), String::new()),
        };
        Ok(Self {
            client,
            connection: None,
            pattern: pattern.to_string(),
            prefix,
            suffix,
        })
    }

}

/// Strips the pattern's static prefix and suffix from a key name.
fn queue_tag(prefix: &str, suffix: &str, key: &str) -> String {
    let name = key
        .strip_prefix(prefix)
        .unwrap_or(key)
        .strip_suffix(suffix)
        .unwrap_or(key);
    format!("queue:{}", name)
}

impl StatsCollector for QueuesStatsCollector {
    fn name(&self) -> &'static str {
        "queues"
    }

    fn collect_stats(&mut self) -> Result<Vec<WrappedMetric>> {
        if self.connection.is_none() {
            self.connection = Some(
                self.client
                    .get_connection()
                    .context("Failed to connect to Redis")?,
            );
        }
        let pattern = self.pattern.clone();
        let prefix = self.prefix.clone();
        let suffix = self.suffix.clone();
        let connection = self
            .connection
            .as_mut()
            .context("Redis connection missing")?;

        let result: redis::RedisResult<Vec<WrappedMetric>> = (|| {
            let keys: Vec<String> = connection.keys(&pattern)?;
            let timestamp = current_timestamp();
            let mut stats = Vec::with_capacity(keys.len());
            for key in keys {
                let size: i64 = connection.hlen(&key)?;
                stats.push(WrappedMetric::new(
                    "Chouette.queues.size",
                    "gauge",
                    Some(timestamp),
                    size as f64,
                    vec![queue_tag(&prefix, &suffix, &key)],
                    None,
                ));
            }
            Ok(stats)
        })();

        match result {
            Ok(stats) => Ok(stats),
            Err(error) => {
                // Drop the connection so the next request reconnects.
                self.connection = None;
                Err(error).context("Failed to sample queue sizes")
            }
        }
    }
}
