//! Log record model for the logs shipping pipeline.
//!
//! Producers enqueue ready-to-ship log records; the agent only merges
//! global tags and the host name before dispatch, so the wrapped payload
//! equals the producer input plus `ddtags` and `host`.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::QueueRecord;
use crate::utils::current_timestamp;

/// A single log record in Datadog logs intake shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    /// Event time, RFC-3339.
    pub date: String,
    pub message: Value,
    pub level: String,
    #[serde(rename = "ddsource")]
    pub source: String,
    pub service: String,
    #[serde(default)]
    pub ddtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl QueueRecord for LogRecord {
    fn queue_timestamp(&self) -> f64 {
        DateTime::parse_from_rfc3339(&self.date)
            .map(|date| date.timestamp_millis() as f64 / 1000.0)
            .unwrap_or_else(|_| current_timestamp())
    }

    fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_timestamp_follows_record_date() {
        let record = LogRecord {
            date: "1970-01-01T01:00:00+00:00".to_string(),
            message: Value::from("started"),
            level: "INFO".to_string(),
            source: "chouette".to_string(),
            service: "tests".to_string(),
            ddtags: vec![],
            host: None,
        };
        assert_eq!(record.queue_timestamp(), 3600.0);
    }

    #[test]
    fn unparsable_date_falls_back_to_now() {
        let record = LogRecord {
            date: "not-a-date".to_string(),
            message: Value::from("oops"),
            level: "WARN".to_string(),
            source: "chouette".to_string(),
            service: "tests".to_string(),
            ddtags: vec![],
            host: None,
        };
        assert!(record.queue_timestamp() > 0.0);
    }
}
