//! The Datadog wrapper
//!
//! A reduced reimplementation of the Datadog agent's aggregation strategy
//! described in <https://docs.datadoghq.com/developers/metrics/types/>:
//!
//! * COUNT sends the sum of the values received during a flush interval.
//! * GAUGE sends the last received value.
//! * RATE sends events per second of the flush interval.
//! * SET sends the number of unique elements submitted during the interval.
//! * HISTOGRAM sends a family of metrics driven by the configured
//!   aggregates and percentiles.
//!
//! DISTRIBUTION metrics are not supported.

use std::collections::HashSet;

use shared::defaults::{default_histogram_aggregates, default_histogram_percentiles};
use shared::{MergedMetric, WrappedMetric};
use tracing::debug;

use super::MetricsWrapper;

pub struct DatadogWrapper {
    histogram_aggregates: Vec<String>,
    histogram_percentiles: Vec<f64>,
}

impl DatadogWrapper {
    pub fn new(histogram_aggregates: Vec<String>, histogram_percentiles: Vec<f64>) -> Self {
        Self {
            histogram_aggregates,
            histogram_percentiles,
        }
    }
}

impl Default for DatadogWrapper {
    fn default() -> Self {
        Self::new(default_histogram_aggregates(), default_histogram_percentiles())
    }
}

impl MetricsWrapper for DatadogWrapper {
    fn wrap_metric(&self, metric: MergedMetric) -> Vec<WrappedMetric> {
        match metric.metric_type.as_str() {
            "count" => wrap_count(metric),
            "rate" => wrap_rate(metric),
            "gauge" => wrap_gauge(metric),
            "set" => wrap_set(metric),
            "histogram" => self.wrap_histogram(metric),
            other => {
                debug!("Ignoring metric of unsupported type '{}'.", other);
                Vec::new()
            }
        }
    }
}

/// Sum of all values; earliest timestamp in the sequence.
fn wrap_count(metric: MergedMetric) -> Vec<WrappedMetric> {
    let Some(values) = numeric(&metric) else {
        return Vec::new();
    };
    vec![WrappedMetric::new(
        metric.metric.clone(),
        "count",
        Some(earliest(&metric.timestamps)),
        values.iter().sum(),
        metric.s_tags(),
        Some(metric.interval),
    )]
}

/// Sum of all values divided by the flush interval: an approximate rate
/// of event occurrences per second.
fn wrap_rate(metric: MergedMetric) -> Vec<WrappedMetric> {
    let Some(values) = numeric(&metric) else {
        return Vec::new();
    };
    let rate = values.iter().sum::<f64>() / metric.interval as f64;
    vec![WrappedMetric::new(
        metric.metric.clone(),
        "rate",
        Some(earliest(&metric.timestamps)),
        rate,
        metric.s_tags(),
        Some(metric.interval),
    )]
}

/// The value carried by the latest sample, stamped with the earliest
/// timestamp of the sequence.
fn wrap_gauge(metric: MergedMetric) -> Vec<WrappedMetric> {
    let Some(values) = numeric(&metric) else {
        return Vec::new();
    };
    let latest = values
        .iter()
        .zip(metric.timestamps.iter())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(value, _)| *value);
    let Some(value) = latest else {
        return Vec::new();
    };
    vec![WrappedMetric::new(
        metric.metric.clone(),
        "gauge",
        Some(earliest(&metric.timestamps)),
        value,
        metric.s_tags(),
        None,
    )]
}

/// Every sample of a set metric is a list of elements; the wrapped point
/// is the cardinality of their union. A sample that is not a list makes
/// the whole metric unwrappable.
fn wrap_set(metric: MergedMetric) -> Vec<WrappedMetric> {
    let mut union: HashSet<String> = HashSet::new();
    for value in &metric.values {
        let Some(elements) = value.as_array() else {
            debug!(
                "Dropping set metric '{}': sample is not a list.",
                metric.metric
            );
            return Vec::new();
        };
        union.extend(elements.iter().map(|element| element.to_string()));
    }
    vec![WrappedMetric::new(
        metric.metric.clone(),
        "count",
        Some(earliest(&metric.timestamps)),
        union.len() as f64,
        metric.s_tags(),
        Some(metric.interval),
    )]
}

impl DatadogWrapper {
    /// Produces the histogram metric family. Which members are generated
    /// is driven by the configured aggregates and percentiles; by default
    /// that is `avg`, `count`, `max`, `median` and the 95th percentile.
    fn wrap_histogram(&self, metric: MergedMetric) -> Vec<WrappedMetric> {
        let Some(values) = numeric(&metric) else {
            return Vec::new();
        };
        let name = &metric.metric;
        let tags = metric.s_tags();
        let timestamp = earliest(&metric.timestamps);
        let interval = metric.interval;
        let count = values.len() as f64;
        let sum: f64 = values.iter().sum();

        let mut wrapped = Vec::new();
        let mut push = |suffix: &str, metric_type: &str, value: f64, interval: Option<u64>| {
            wrapped.push(WrappedMetric::new(
                format!("{}.{}", name, suffix),
                metric_type,
                Some(timestamp),
                value,
                tags.clone(),
                interval,
            ));
        };

        for aggregate in &self.histogram_aggregates {
            match aggregate.as_str() {
                "avg" => push("avg", "gauge", sum / count, None),
                "count" => push("count", "rate", count / interval as f64, Some(interval)),
                "sum" => push("sum", "gauge", sum, None),
                "min" => push(
                    "min",
                    "gauge",
                    values.iter().copied().fold(f64::MAX, f64::min),
                    None,
                ),
                "max" => push(
                    "max",
                    "gauge",
                    values.iter().copied().fold(f64::MIN, f64::max),
                    None,
                ),
                "median" => {
                    if let Some(median) = percentile(&values, 0.5) {
                        push("median", "gauge", median, None);
                    }
                }
                other => debug!("Ignoring unknown histogram aggregate '{}'.", other),
            }
        }

        for requested in &self.histogram_percentiles {
            if let Some(value) = percentile(&values, *requested) {
                push(
                    &format!("{}percentile", (requested * 100.0) as i64),
                    "gauge",
                    value,
                    None,
                );
            }
        }

        wrapped
    }
}

/// Interpolated percentile over an unsorted data set.
///
/// For a sorted copy `s` of length `n` and `p` in `[0, 1]` the rank is
/// `i = (n - 1) * p`; an integral rank returns `s[i]`, otherwise the two
/// neighbors are interpolated linearly.
pub fn percentile(values: &[f64], percent: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (sorted.len() - 1) as f64 * percent;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let left = sorted[lower] * (upper as f64 - rank);
    let right = sorted[upper] * (rank - lower as f64);
    Some(left + right)
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

fn earliest(timestamps: &[f64]) -> f64 {
    timestamps.iter().copied().fold(f64::MAX, f64::min)
}
