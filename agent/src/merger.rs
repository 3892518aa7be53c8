//! Grouping and merging of raw metrics
//!
//! The aggregator hands this module the raw queue content in two steps:
//! first keys are partitioned into flush-interval buckets, then each
//! bucket's payloads are parsed and folded by metric identity into
//! MergedMetrics ready for wrapping.

use std::collections::{BTreeMap, HashMap};

use shared::{MergedMetric, RawMetric};
use tracing::{debug, warn};

/// Partitions `(key, timestamp)` pairs into flush-interval buckets:
/// records with `floor(timestamp / flush_interval)` equal land together.
/// Buckets come back in ascending bucket order; inside a bucket the input
/// order (storage order) is preserved.
pub fn group_metric_keys(keys_and_ts: &[(String, f64)], flush_interval: u64) -> Vec<Vec<String>> {
    let interval = flush_interval as f64;
    let mut buckets: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for (key, timestamp) in keys_and_ts {
        let bucket = (timestamp / interval).floor() as i64;
        buckets.entry(bucket).or_default().push(key.clone());
    }
    buckets.into_values().collect()
}

/// Parses raw JSON payloads and folds them into one MergedMetric per
/// identity. Payloads that fail to parse are dropped; they never abort
/// the batch.
pub fn merge_metrics(payloads: &[String], flush_interval: u64) -> Vec<MergedMetric> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, MergedMetric> = HashMap::new();

    for payload in payloads {
        let Some(metric) = cast_to_metric(payload, flush_interval) else {
            continue;
        };
        let id = metric.id().to_string();
        match groups.remove(&id) {
            Some(existing) => match existing.merge(metric) {
                Ok(merged) => {
                    groups.insert(id, merged);
                }
                Err(error) => warn!("Dropping an unmergeable metric: {}", error),
            },
            None => {
                order.push(id.clone());
                groups.insert(id, metric);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect()
}

fn cast_to_metric(payload: &str, flush_interval: u64) -> Option<MergedMetric> {
    match serde_json::from_str::<RawMetric>(payload) {
        Ok(raw) => Some(MergedMetric::from_raw(raw, flush_interval)),
        Err(error) => {
            debug!("Dropping a raw record that is not a metric: {}", error);
            None
        }
    }
}
