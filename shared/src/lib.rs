//! Shared data structures and utilities for the Chouette shipping agent
//!
//! This crate contains the metric and log data model, environment-driven
//! configuration and common utilities used by the agent components.

pub mod config;
pub mod defaults;
pub mod logs;
pub mod metrics;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{ChouetteConfig, StorageType};
pub use logs::LogRecord;
pub use metrics::{MergedMetric, QueueRecord, RawMetric, WrappedMetric};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the shipping agent
#[derive(Debug, thiserror::Error)]
pub enum ChouetteError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Ingestion API rejected the request: {0}")]
    UpstreamReject(String),

    #[error("Cannot merge metrics with different identities: '{0}' vs '{1}'")]
    MergeIdentity(String, String),
}
