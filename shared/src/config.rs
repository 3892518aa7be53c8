//! Configuration for the shipping agent
//!
//! The agent is configured entirely through environment variables. This
//! module assembles a validated `ChouetteConfig` from them, applying the
//! defaults from the `defaults` module for everything optional.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::defaults::*;
use crate::{ChouetteError, Result};

/// Which backing store the storage component owns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Redis,
    Sqlite,
}

impl FromStr for StorageType {
    type Err = ChouetteError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "redis" => Ok(StorageType::Redis),
            "sqlite" => Ok(StorageType::Sqlite),
            other => Err(ChouetteError::Config(format!(
                "unknown storage type '{}', expected 'redis' or 'sqlite'",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Redis => write!(f, "redis"),
            StorageType::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Agent configuration assembled from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChouetteConfig {
    /// Datadog API key. Required.
    pub api_key: String,
    /// Global tags appended to every dispatched metric and log.
    pub global_tags: Vec<String>,
    /// Host name stamped onto dispatched records when set.
    pub host: Option<String>,
    /// Metrics ingestion API base URL.
    pub datadog_url: String,
    /// Logs intake API base URL.
    pub datadog_logs_url: String,
    /// Wrapper strategy: "simple", "datadog" or "none".
    pub metrics_wrapper: String,
    /// Aggregation flush interval in seconds.
    pub aggregate_interval: u64,
    /// Plugin capture interval in seconds.
    pub capture_interval: u64,
    /// Dispatch interval in seconds.
    pub release_interval: u64,
    /// Maximum metrics per dispatch request.
    pub metrics_bulk_size: usize,
    /// Maximum log records per dispatch request.
    pub logs_bulk_size: usize,
    /// Metric record TTL in seconds.
    pub metric_ttl: u64,
    /// Log record TTL in seconds.
    pub log_ttl: u64,
    /// Whether to emit the agent's own telemetry.
    pub send_self_metrics: bool,
    /// Names of collector plugins to run.
    pub collector_plugins: Vec<String>,
    pub storage_type: StorageType,
    pub redis_host: String,
    pub redis_port: u16,
    /// SQLite database file path (sqlite storage only).
    pub db_path: String,
    /// Aggregates produced for histogram metrics by the Datadog wrapper.
    pub histogram_aggregates: Vec<String>,
    /// Percentiles produced for histogram metrics by the Datadog wrapper.
    pub histogram_percentiles: Vec<f64>,
    pub log_level: String,
    /// Redis key pattern sampled by the `queues` collector plugin.
    pub queues_pattern: String,
}

impl ChouetteConfig {
    /// Assembles and validates the configuration from the process
    /// environment. Any missing required key or malformed value is a fatal
    /// startup error.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Assembles the configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let config = Self {
            api_key: required(vars, "API_KEY")?,
            global_tags: json_or(vars, "GLOBAL_TAGS", Vec::new())?,
            host: vars.get("HOST").cloned().filter(|host| !host.is_empty()),
            datadog_url: string_or(vars, "DATADOG_URL", default_datadog_url()),
            datadog_logs_url: string_or(vars, "DATADOG_LOGS_URL", default_datadog_logs_url()),
            metrics_wrapper: string_or(vars, "METRICS_WRAPPER", default_metrics_wrapper()),
            aggregate_interval: parse_or(vars, "AGGREGATE_INTERVAL", default_aggregate_interval())?,
            capture_interval: parse_or(vars, "CAPTURE_INTERVAL", default_capture_interval())?,
            release_interval: parse_or(vars, "RELEASE_INTERVAL", default_release_interval())?,
            metrics_bulk_size: parse_or(vars, "METRICS_BULK_SIZE", default_metrics_bulk_size())?,
            logs_bulk_size: parse_or(vars, "LOGS_BULK_SIZE", default_logs_bulk_size())?,
            metric_ttl: parse_or(vars, "METRIC_TTL", default_record_ttl())?,
            log_ttl: parse_or(vars, "LOG_TTL", default_record_ttl())?,
            send_self_metrics: parse_or(vars, "SEND_SELF_METRICS", true)?,
            collector_plugins: json_or(vars, "COLLECTOR_PLUGINS", Vec::new())?,
            storage_type: parse_or(vars, "STORAGE_TYPE", StorageType::Redis)?,
            redis_host: string_or(vars, "REDIS_HOST", default_redis_host()),
            redis_port: parse_or(vars, "REDIS_PORT", default_redis_port())?,
            db_path: string_or(vars, "CHOUETTE_DB_PATH", default_db_path()),
            histogram_aggregates: json_or(
                vars,
                "HISTOGRAM_AGGREGATES",
                default_histogram_aggregates(),
            )?,
            histogram_percentiles: json_or(
                vars,
                "HISTOGRAM_PERCENTILES",
                default_histogram_percentiles(),
            )?,
            log_level: string_or(vars, "LOG_LEVEL", default_log_level()),
            queues_pattern: string_or(vars, "QUEUES_PATTERN", default_queues_pattern()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation of the assembled configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ChouetteError::Config("API_KEY must not be empty".to_string()).into());
        }

        validate_url(&self.datadog_url).context("DATADOG_URL is invalid")?;
        validate_url(&self.datadog_logs_url).context("DATADOG_LOGS_URL is invalid")?;

        for (name, value) in [
            ("AGGREGATE_INTERVAL", self.aggregate_interval),
            ("CAPTURE_INTERVAL", self.capture_interval),
            ("RELEASE_INTERVAL", self.release_interval),
            ("METRIC_TTL", self.metric_ttl),
            ("LOG_TTL", self.log_ttl),
        ] {
            if value == 0 {
                return Err(
                    ChouetteError::Config(format!("{} must be positive", name)).into(),
                );
            }
        }

        if self.metrics_bulk_size == 0 || self.logs_bulk_size == 0 {
            return Err(
                ChouetteError::Config("bulk sizes must be positive".to_string()).into(),
            );
        }

        if !matches!(self.metrics_wrapper.as_str(), "simple" | "datadog" | "none") {
            return Err(ChouetteError::Config(format!(
                "unknown metrics wrapper '{}', expected 'simple', 'datadog' or 'none'",
                self.metrics_wrapper
            ))
            .into());
        }

        const KNOWN_AGGREGATES: [&str; 6] = ["avg", "count", "sum", "min", "max", "median"];
        for aggregate in &self.histogram_aggregates {
            if !KNOWN_AGGREGATES.contains(&aggregate.as_str()) {
                return Err(ChouetteError::Config(format!(
                    "unknown histogram aggregate '{}'",
                    aggregate
                ))
                .into());
            }
        }

        for percentile in &self.histogram_percentiles {
            if !(*percentile > 0.0 && *percentile < 1.0) {
                return Err(ChouetteError::Config(format!(
                    "histogram percentile {} is outside (0, 1)",
                    percentile
                ))
                .into());
            }
        }

        Ok(())
    }

    /// HTTP timeout for dispatch requests: 80% of the release interval,
    /// truncated to whole seconds, never below one second.
    pub fn dispatch_timeout(&self) -> Duration {
        let seconds = (self.release_interval as f64 * 0.8) as u64;
        Duration::from_secs(seconds.max(1))
    }
}

fn required(vars: &HashMap<String, String>, key: &str) -> Result<String> {
    vars.get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| ChouetteError::Config(format!("{} is required", key)).into())
}

fn string_or(vars: &HashMap<String, String>, key: &str, default: String) -> String {
    vars.get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or(default)
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key).filter(|value| !value.is_empty()) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|error| {
            ChouetteError::Config(format!("cannot parse {}='{}': {}", key, value, error)).into()
        }),
    }
}

fn json_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: DeserializeOwned,
{
    match vars.get(key).filter(|value| !value.is_empty()) {
        None => Ok(default),
        Some(value) => serde_json::from_str(value).map_err(|error| {
            ChouetteError::Config(format!("cannot parse {}='{}': {}", key, value, error)).into()
        }),
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|error| ChouetteError::Config(format!("invalid URL '{}': {}", url, error)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ChouetteError::Config(format!(
            "URL '{}' must use http:// or https:// scheme",
            url
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = ChouetteConfig::from_vars(&vars(&[("API_KEY", "dd-key")])).unwrap();
        assert_eq!(config.aggregate_interval, 10);
        assert_eq!(config.capture_interval, 30);
        assert_eq!(config.release_interval, 60);
        assert_eq!(config.metrics_bulk_size, 10_000);
        assert_eq!(config.logs_bulk_size, 500);
        assert_eq!(config.metric_ttl, 14_400);
        assert_eq!(config.storage_type, StorageType::Redis);
        assert_eq!(config.metrics_wrapper, "simple");
        assert!(config.send_self_metrics);
        assert!(config.global_tags.is_empty());
        assert!(config.host.is_none());
    }

    #[test]
    fn missing_api_key_is_fatal() {
        assert!(ChouetteConfig::from_vars(&vars(&[])).is_err());
    }

    #[test]
    fn json_lists_are_parsed() {
        let config = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("GLOBAL_TAGS", r#"["env:prod", "device:owl"]"#),
            ("COLLECTOR_PLUGINS", r#"["host", "queues"]"#),
            ("HISTOGRAM_PERCENTILES", "[0.5, 0.99]"),
        ]))
        .unwrap();
        assert_eq!(config.global_tags, vec!["env:prod", "device:owl"]);
        assert_eq!(config.collector_plugins, vec!["host", "queues"]);
        assert_eq!(config.histogram_percentiles, vec![0.5, 0.99]);
    }

    #[test]
    fn malformed_json_list_is_rejected() {
        let result = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("GLOBAL_TAGS", "env:prod"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_wrapper_is_rejected() {
        let result = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("METRICS_WRAPPER", "fancy"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn sqlite_storage_is_selectable() {
        let config = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("STORAGE_TYPE", "sqlite"),
            ("CHOUETTE_DB_PATH", "/tmp/chouette.sqlite"),
        ]))
        .unwrap();
        assert_eq!(config.storage_type, StorageType::Sqlite);
        assert_eq!(config.db_path, "/tmp/chouette.sqlite");
    }

    #[test]
    fn dispatch_timeout_is_fraction_of_release_interval() {
        let config = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("RELEASE_INTERVAL", "60"),
        ]))
        .unwrap();
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(48));
    }

    #[test]
    fn out_of_range_percentile_is_rejected() {
        let result = ChouetteConfig::from_vars(&vars(&[
            ("API_KEY", "dd-key"),
            ("HISTOGRAM_PERCENTILES", "[1.5]"),
        ]));
        assert!(result.is_err());
    }
}
