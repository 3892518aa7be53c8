//! Wrapper strategies turning MergedMetrics into wire points
//!
//! A wrapper decides how the samples collected during one flush interval
//! collapse into Datadog data points. Two strategies exist: a simple
//! average/count wrapper and a reduced reimplementation of the Datadog
//! agent's own type semantics.

// Wrapper implementations
mod datadog;
mod simple;

pub use datadog::{percentile, DatadogWrapper};
pub use simple::SimpleWrapper;

use shared::{ChouetteConfig, MergedMetric, WrappedMetric};

/// Strategy turning each MergedMetric into zero or more WrappedMetrics.
pub trait MetricsWrapper: Send + Sync {
    fn wrap_metric(&self, metric: MergedMetric) -> Vec<WrappedMetric>;

    fn wrap_metrics(&self, merged: Vec<MergedMetric>) -> Vec<WrappedMetric> {
        merged
            .into_iter()
            .flat_map(|metric| self.wrap_metric(metric))
            .collect()
    }
}

/// Resolves a configured wrapper name. Unknown names (including the
/// explicit "none") yield no wrapper, which disables aggregation.
pub fn wrapper_for(name: &str, config: &ChouetteConfig) -> Option<Box<dyn MetricsWrapper>> {
    match name {
        "simple" => Some(Box::new(SimpleWrapper)),
        "datadog" => Some(Box::new(DatadogWrapper::new(
            config.histogram_aggregates.clone(),
            config.histogram_percentiles.clone(),
        ))),
        _ => None,
    }
}
