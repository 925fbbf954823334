//! End-to-end coverage for the Shard engine: write, flush, restart, and the
//! cross-generation merge policy, none of which a single module's unit
//! tests can exercise on their own.

use std::time::Duration;

use shard_store::engine::Engine;
use shard_store::engine::RawPoint;
use shard_store::tables::Sample;
use shard_store::{FieldType, ShardConfig};

fn point(metric: &str, tags: &[(&str, &str)], field: &str, ts: i64, value: f64) -> RawPoint {
    RawPoint {
        metric: metric.to_string(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        field: field.to_string(),
        field_type: FieldType::Sum,
        timestamp: ts,
        value,
    }
}

fn config(dir: &std::path::Path) -> ShardConfig {
    ShardConfig::builder(dir)
        .memdb_flush_threshold_bytes(64 * 1024 * 1024)
        .memdb_flush_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

#[test]
fn empty_flush_produces_decodable_nameid_and_meta_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();

    let report = engine.flush().unwrap();
    assert_eq!(report.metrics, 0);
    assert_eq!(report.series, 0);
    assert_eq!(report.points, 0);

    engine.close().unwrap();

    // Reopening replays the same (empty) generation without error.
    let engine = Engine::open(config(dir.path())).unwrap();
    assert_eq!(engine.lookup_metric("cpu"), None);
    engine.close().unwrap();
}

#[test]
fn write_flush_reopen_and_query_sees_the_point() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();

    let results = engine.write_batch(vec![point(
        "cpu",
        &[("host", "a"), ("region", "us-east")],
        "usage",
        1_000,
        42.0,
    )]);
    assert!(results[0].is_ok());

    let report = engine.flush().unwrap();
    assert_eq!(report.metrics, 1);
    assert_eq!(report.series, 1);
    assert_eq!(report.points, 1);

    engine.close().unwrap();

    let engine = Engine::open(config(dir.path())).unwrap();
    let metric_id = engine.lookup_metric("cpu").expect("metric survives restart");

    let loaded = engine
        .load(
            "cpu",
            vec![("host", "a"), ("region", "us-east")],
            "usage",
            (0, 10_000),
        )
        .unwrap();
    assert_eq!(loaded, vec![(1_000, Sample::Scalar(42.0))]);

    let tag_values = engine.suggest_tag_values(metric_id, "host").unwrap();
    assert_eq!(tag_values, vec!["a".to_string()]);

    engine.close().unwrap();
}

#[test]
fn restart_reseeds_metric_and_series_identity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 1.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();

    engine
        .write_batch(vec![point("memory", &[("host", "b")], "used", 2_000, 2.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();
    engine.close().unwrap();

    let engine = Engine::open(config(dir.path())).unwrap();
    let cpu_id = engine.lookup_metric("cpu").unwrap();
    let memory_id = engine.lookup_metric("memory").unwrap();
    assert_ne!(cpu_id, memory_id);

    // A point on a brand-new metric after restart must not collide with
    // either restored metric id.
    engine
        .write_batch(vec![point("disk", &[("host", "c")], "free", 3_000, 3.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    let disk_id = engine.lookup_metric("disk").unwrap();
    assert_ne!(disk_id, cpu_id);
    assert_ne!(disk_id, memory_id);

    // Re-resolving the same tag combination for a restored metric must
    // return the same series id it had before the restart, not a fresh one.
    let loaded = engine
        .load("cpu", vec![("host", "a")], "usage", (0, 10_000))
        .unwrap();
    assert_eq!(loaded, vec![(1_000, Sample::Scalar(1.0))]);

    engine.close().unwrap();
}

#[test]
fn overlapping_generations_merge_last_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();

    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 1.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();

    // Same series, same field, same timestamp, a later generation: this
    // must shadow the first generation's value rather than sum with it
    // (summing would be FieldType::Sum's merge policy, which only applies
    // to same-timestamp collisions within a single unflushed buffer).
    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 99.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();

    let loaded = engine
        .load("cpu", vec![("host", "a")], "usage", (0, 10_000))
        .unwrap();
    assert_eq!(loaded, vec![(1_000, Sample::Scalar(99.0))]);

    engine.close().unwrap();
}

#[test]
fn unflushed_buffer_overlays_on_disk_generations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();

    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 1.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();

    // Not flushed: must still be visible, freshest of all layers.
    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 7.0)])
        .into_iter()
        .for_each(|r| r.unwrap());

    let loaded = engine
        .load("cpu", vec![("host", "a")], "usage", (0, 10_000))
        .unwrap();
    assert_eq!(loaded, vec![(1_000, Sample::Scalar(7.0))]);

    engine.close().unwrap();
}

#[test]
fn unknown_metric_or_tag_combination_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine
        .write_batch(vec![point("cpu", &[("host", "a")], "usage", 1_000, 1.0)])
        .into_iter()
        .for_each(|r| r.unwrap());
    engine.flush().unwrap();

    assert!(engine
        .load("gpu", vec![], "usage", (0, 10_000))
        .unwrap()
        .is_empty());
    assert!(engine
        .load("cpu", vec![("host", "missing")], "usage", (0, 10_000))
        .unwrap()
        .is_empty());

    engine.close().unwrap();
}

#[test]
fn suggest_metrics_filters_by_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    for name in ["cpu.user", "cpu.system", "memory.used"] {
        engine
            .write_batch(vec![point(name, &[], "v", 1_000, 1.0)])
            .into_iter()
            .for_each(|r| r.unwrap());
    }

    let mut names = engine.suggest_metrics("cpu.", 10);
    names.sort();
    assert_eq!(names, vec!["cpu.system".to_string(), "cpu.user".to_string()]);

    engine.close().unwrap();
}
