//! Utility functions shared across agent components.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp as fractional seconds.
///
/// Record timestamps are floats end to end: producers may submit
/// sub-second timestamps and the storage layer orders records by them.
pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Get the current Unix timestamp in whole seconds.
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
