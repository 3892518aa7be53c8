//! Default values for configuration parameters
//!
//! This module centralizes the default values applied when the corresponding
//! environment variables are not set.

/// Default Datadog metrics API base URL
pub fn default_datadog_url() -> String {
    "https://api.datadoghq.com/api".to_string()
}

/// Default Datadog logs intake base URL
pub fn default_datadog_logs_url() -> String {
    "https://http-intake.logs.datadoghq.com/api".to_string()
}

/// Default metrics wrapper strategy
pub fn default_metrics_wrapper() -> String {
    "simple".to_string()
}

/// Default aggregation flush interval (10 seconds)
pub fn default_aggregate_interval() -> u64 {
    10
}

/// Default plugin capture interval (30 seconds)
pub fn default_capture_interval() -> u64 {
    30
}

/// Default dispatch interval (60 seconds)
pub fn default_release_interval() -> u64 {
    60
}

/// Default maximum number of metrics per dispatch request
pub fn default_metrics_bulk_size() -> usize {
    10_000
}

/// Default maximum number of log records per dispatch request
pub fn default_logs_bulk_size() -> usize {
    500
}

/// Default record TTL (4 hours; Datadog rejects older data points)
pub fn default_record_ttl() -> u64 {
    14_400
}

/// Default Redis host
pub fn default_redis_host() -> String {
    "redis".to_string()
}

/// Default Redis port
pub fn default_redis_port() -> u16 {
    6379
}

/// Default SQLite database file path
pub fn default_db_path() -> String {
    "/chouette/chouette.sqlite".to_string()
}

/// Default histogram aggregates produced by the Datadog wrapper
pub fn default_histogram_aggregates() -> Vec<String> {
    vec![
        "max".to_string(),
        "median".to_string(),
        "avg".to_string(),
        "count".to_string(),
    ]
}

/// Default histogram percentiles produced by the Datadog wrapper
pub fn default_histogram_percentiles() -> Vec<f64> {
    vec![0.95]
}

/// Default log level
pub fn default_log_level() -> String {
    "INFO".to_string()
}

/// Default Redis key pattern sampled by the `queues` collector plugin
pub fn default_queues_pattern() -> String {
    "dramatiq:*.msgs".to_string()
}
