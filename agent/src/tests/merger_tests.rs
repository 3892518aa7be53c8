//! Tests for raw metric grouping and merging

use crate::merger::{group_metric_keys, merge_metrics};

fn keys(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
    pairs
        .iter()
        .map(|(key, ts)| (key.to_string(), *ts))
        .collect()
}

#[test]
fn keys_are_bucketed_by_flush_interval() {
    let input = keys(&[("key-1", 9.0), ("key-2", 11.0), ("key-3", 18.0), ("key-4", 21.0)]);
    let groups = group_metric_keys(&input, 10);
    assert_eq!(
        groups,
        vec![
            vec!["key-1".to_string()],
            vec!["key-2".to_string(), "key-3".to_string()],
            vec!["key-4".to_string()],
        ]
    );
}

#[test]
fn buckets_come_back_in_ascending_order() {
    // Records out of timestamp order are allowed in a queue.
    let input = keys(&[("late", 35.0), ("early", 5.0), ("middle", 15.0)]);
    let groups = group_metric_keys(&input, 10);
    assert_eq!(
        groups,
        vec![
            vec!["early".to_string()],
            vec!["middle".to_string()],
            vec!["late".to_string()],
        ]
    );
}

#[test]
fn empty_key_list_produces_no_buckets() {
    assert!(group_metric_keys(&[], 10).is_empty());
}

#[test]
fn same_identity_records_fold_into_one_metric() {
    let payloads = vec![
        r#"{"metric":"m","type":"count","timestamp":1.0,"value":1,"tags":{"a":"b"}}"#.to_string(),
        r#"{"metric":"m","type":"count","timestamp":2.0,"value":2,"tags":{"a":"b"}}"#.to_string(),
    ];
    let merged = merge_metrics(&payloads, 10);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].values.len(), 2);
    assert_eq!(merged[0].timestamps, vec![1.0, 2.0]);
    assert_eq!(merged[0].interval, 10);
}

#[test]
fn different_identities_stay_separate() {
    let payloads = vec![
        r#"{"metric":"m","type":"count","timestamp":1.0,"value":1}"#.to_string(),
        r#"{"metric":"m","type":"gauge","timestamp":2.0,"value":2}"#.to_string(),
        r#"{"metric":"m","type":"count","timestamp":3.0,"value":3,"tags":{"a":"b"}}"#.to_string(),
    ];
    let merged = merge_metrics(&payloads, 10);
    assert_eq!(merged.len(), 3);
}

#[test]
fn non_adjacent_records_with_one_identity_still_merge() {
    let payloads = vec![
        r#"{"metric":"m","type":"count","timestamp":1.0,"value":1}"#.to_string(),
        r#"{"metric":"other","type":"count","timestamp":2.0,"value":1}"#.to_string(),
        r#"{"metric":"m","type":"count","timestamp":3.0,"value":1}"#.to_string(),
    ];
    let merged = merge_metrics(&payloads, 10);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].metric, "m");
    assert_eq!(merged[0].values.len(), 2);
}

#[test]
fn broken_payloads_are_dropped_silently() {
    let payloads = vec![
        "not json at all".to_string(),
        r#"{"metric":"no-timestamp","type":"count","value":1}"#.to_string(),
        r#"{"metric":"m","type":"count","timestamp":1.0,"value":1}"#.to_string(),
    ];
    let merged = merge_metrics(&payloads, 10);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].metric, "m");
}
