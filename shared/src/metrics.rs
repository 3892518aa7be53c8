//! Metric data structures for the aggregation pipeline
//!
//! Raw metrics are what producers submit to the raw queue. During a flush
//! the aggregator folds raw metrics sharing an identity into a MergedMetric,
//! and a wrapper strategy turns each MergedMetric into wire-ready
//! WrappedMetrics that the sender dispatches to Datadog.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::current_timestamp;
use crate::ChouetteError;

/// Casts a tag map into the canonical wire form: a sorted list of
/// "key:value" strings. Determinism here is what makes metric identities
/// stable across submissions.
pub fn stringify_tags(tags: &HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = tags
        .iter()
        .map(|(name, value)| format!("{}:{}", name, value))
        .collect();
    list.sort();
    list
}

/// A record that can be persisted into a storage queue.
///
/// The storage layer indexes every record under its timestamp and stores
/// its JSON payload; records whose serialization fails are skipped.
pub trait QueueRecord {
    fn queue_timestamp(&self) -> f64;
    fn payload_json(&self) -> serde_json::Result<String>;
}

/// A raw metric sample as submitted by a producer application.
///
/// `value` is a scalar for most types; `set` metrics carry a list of
/// elements observed during the sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMetric {
    pub metric: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub timestamp: f64,
    pub value: Value,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl RawMetric {
    /// A `count` sample stamped with the current time. Used for the agent's
    /// own telemetry.
    pub fn count(metric: impl Into<String>, value: f64) -> Self {
        Self::self_metric(metric, "count", value)
    }

    /// A `gauge` sample stamped with the current time.
    pub fn gauge(metric: impl Into<String>, value: f64) -> Self {
        Self::self_metric(metric, "gauge", value)
    }

    fn self_metric(metric: impl Into<String>, metric_type: &str, value: f64) -> Self {
        Self {
            metric: metric.into(),
            metric_type: metric_type.to_string(),
            timestamp: current_timestamp(),
            value: Value::from(value),
            tags: HashMap::new(),
        }
    }
}

impl QueueRecord for RawMetric {
    fn queue_timestamp(&self) -> f64 {
        self.timestamp
    }

    fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An aggregation of raw samples sharing one identity within one flush
/// bucket.
///
/// MergedMetrics never leave the aggregator: they exist between the raw
/// queue and the wrapper. The identity is `(name, type, sorted tags)`;
/// only metrics with equal identities may be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMetric {
    pub metric: String,
    pub metric_type: String,
    pub values: Vec<Value>,
    pub timestamps: Vec<f64>,
    pub tags: HashMap<String, String>,
    /// Flush interval the samples were bucketed by, in seconds.
    pub interval: u64,
    id: String,
}

impl MergedMetric {
    pub fn new(
        metric: String,
        metric_type: String,
        values: Vec<Value>,
        timestamps: Vec<f64>,
        tags: HashMap<String, String>,
        interval: u64,
    ) -> Self {
        let id = Self::identity(&metric, &metric_type, &tags);
        Self {
            metric,
            metric_type,
            values,
            timestamps,
            tags,
            interval,
            id,
        }
    }

    /// A single-sample MergedMetric, the unit the aggregator folds over.
    pub fn from_raw(raw: RawMetric, interval: u64) -> Self {
        Self::new(
            raw.metric,
            raw.metric_type,
            vec![raw.value],
            vec![raw.timestamp],
            raw.tags,
            interval,
        )
    }

    fn identity(metric: &str, metric_type: &str, tags: &HashMap<String, String>) -> String {
        format!(
            "{}_{}_{}",
            metric,
            metric_type,
            stringify_tags(tags).join("_")
        )
    }

    /// Unique identity of this metric: name, type and canonical tags.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tags in their canonical wire form.
    pub fn s_tags(&self) -> Vec<String> {
        stringify_tags(&self.tags)
    }

    /// The merge operation: concatenates values and timestamps of two
    /// metrics with the same identity. Merging different identities is
    /// an error.
    pub fn merge(mut self, other: MergedMetric) -> Result<MergedMetric, ChouetteError> {
        if self.id != other.id {
            return Err(ChouetteError::MergeIdentity(self.id, other.id));
        }
        self.values.extend(other.values);
        self.timestamps.extend(other.timestamps);
        Ok(self)
    }

    /// All values as floats, or None if any value is non-numeric
    /// (e.g. the element lists of a `set` metric).
    pub fn numeric_values(&self) -> Option<Vec<f64>> {
        self.values.iter().map(Value::as_f64).collect()
    }
}

/// A wire-ready Datadog data point.
///
/// Carries exactly one `[timestamp, value]` point, canonical tags and,
/// for count-like types, the flush interval the point covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WrappedMetric {
    pub metric: String,
    pub tags: Vec<String>,
    pub points: Vec<(f64, f64)>,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl WrappedMetric {
    pub fn new(
        metric: impl Into<String>,
        metric_type: impl Into<String>,
        timestamp: Option<f64>,
        value: f64,
        tags: Vec<String>,
        interval: Option<u64>,
    ) -> Self {
        let timestamp = timestamp.unwrap_or_else(current_timestamp);
        Self {
            metric: metric.into(),
            tags,
            points: vec![(timestamp, value)],
            metric_type: metric_type.into(),
            interval,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.points.first().map(|point| point.0).unwrap_or_default()
    }

    pub fn value(&self) -> f64 {
        self.points.first().map(|point| point.1).unwrap_or_default()
    }
}

impl QueueRecord for WrappedMetric {
    fn queue_timestamp(&self) -> f64 {
        self.timestamp()
    }

    fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
