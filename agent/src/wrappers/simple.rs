//! The simple wrapper
//!
//! Recognizes only `count` metrics; anything else is treated as a value
//! series and shipped as an average. Unlike the Datadog wrapper it does not
//! reproduce gauge/rate/set semantics, which makes it a predictable default
//! for producers that just want their numbers on a dashboard.

use shared::{MergedMetric, WrappedMetric};
use tracing::debug;

use super::MetricsWrapper;

pub struct SimpleWrapper;

impl MetricsWrapper for SimpleWrapper {
    fn wrap_metric(&self, metric: MergedMetric) -> Vec<WrappedMetric> {
        match metric.metric_type.as_str() {
            "count" => wrap_count(metric),
            _ => wrap_average(metric),
        }
    }
}

/// One `count` point: the sum of all values at the latest sample time.
fn wrap_count(metric: MergedMetric) -> Vec<WrappedMetric> {
    let Some(values) = numeric(&metric) else {
        return Vec::new();
    };
    vec![WrappedMetric::new(
        metric.metric.clone(),
        "count",
        Some(latest(&metric.timestamps)),
        values.iter().sum(),
        metric.s_tags(),
        Some(metric.interval),
    )]
}

/// Two points: a `gauge` with the average of the values and a `count`
/// companion (name suffixed with `.count`) carrying how many samples the
/// average was computed from.
fn wrap_average(metric: MergedMetric) -> Vec<WrappedMetric> {
    let Some(values) = numeric(&metric) else {
        return Vec::new();
    };
    let count = values.len();
    let average = values.iter().sum::<f64>() / count as f64;
    let timestamp = latest(&metric.timestamps);
    let tags = metric.s_tags();
    vec![
        WrappedMetric::new(
            metric.metric.clone(),
            "gauge",
            Some(timestamp),
            average,
            tags.clone(),
            None,
        ),
        WrappedMetric::new(
            format!("{}.count", metric.metric),
            "count",
            Some(timestamp),
            count as f64,
            tags,
            Some(metric.interval),
        ),
    ]
}

fn numeric(metric: &MergedMetric) -> Option<Vec<f64>> {
    let values = metric.numeric_values().filter(|values| !values.is_empty());
    if values.is_none() {
        debug!(
            "Dropping metric '{}' with non-numeric or empty values.",
            metric.metric
        );
    }
    values
}

fn latest(timestamps: &[f64]) -> f64 {
    timestamps.iter().copied().fold(f64::MIN, f64::max)
}
