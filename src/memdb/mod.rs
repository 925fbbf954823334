//! The concurrent in-memory write buffer sitting in front of the on-disk
//! table families.
//!
//! Structure: a map `metric_id -> MetricStore`, where `MetricStore` holds a
//! map `series_id -> TimeSeriesStore`, and `TimeSeriesStore` holds a map
//! `field_id -> FieldStore`. This is a tree of owned child tables addressed
//! by dense/hash indices with no back-pointers; callers pass `(metric_id,
//! series_id)` context down on every call instead of navigating upward from
//! a leaf.
//!
//! Concurrency: metric and series identity (which tag combination maps to
//! which series id, which tag value maps to which id) is never reset, so
//! those ids stay stable across every flush they're written in. A flush only
//! drains the unflushed sample buffers at the leaves, each under its own
//! `parking_lot::Mutex`/`RwLock`, so draining one series never blocks a
//! concurrent writer touching a different one.

pub mod field_store;
pub mod metric_store;
pub mod series_store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

pub use field_store::FieldStore;
pub use metric_store::MetricStore;
pub use series_store::TimeSeriesStore;

use crate::error::{Error, Result};
use crate::tables::Sample;
use crate::{FieldId, FieldType, MetricId, SeriesId, TagKeyId, Timestamp};

/// The durable identity layer: every metric, series, tag-value assignment,
/// and series-to-tag-vector mapping ever seen, none of which is ever reset.
/// Only the *unflushed sample buffers* underneath (`TimeSeriesStore`'s
/// columns) are drained by `freeze`; this registry just keeps growing so a
/// series id or tag-value id stays stable across every generation it
/// appears in.
#[derive(Default)]
struct Root {
    metrics: RwLock<HashMap<MetricId, Arc<MetricStore>>>,
}

/// One point accepted by `write` or replayed by `replay`. The
/// MemoryDatabase expects `series_id` already resolved via `resolve_series`.
#[derive(Debug, Clone, Copy)]
pub struct Point {
    pub metric_id: MetricId,
    pub series_id: SeriesId,
    pub field_id: FieldId,
    pub field_type: FieldType,
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Summary returned by a flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushStats {
    pub generation: u64,
    pub metrics: usize,
    pub series: usize,
    pub points: u64,
}

/// One metric's newly-drained series data, handed to the flush worker by
/// `freeze`. Series with nothing new since the last flush are omitted.
pub type DrainedMetric = (
    MetricId,
    Arc<MetricStore>,
    Vec<(SeriesId, HashMap<FieldId, (FieldType, crate::tables::ColumnWriter)>)>,
);

/// The result of one `freeze`: only the points accumulated since the
/// previous flush, grouped by metric and series. Series identity, tag-value
/// ids, and every other piece of the identity layer are untouched — they
/// live in `Root` for as long as the database does.
pub struct FrozenGeneration {
    pub generation: u64,
    entries: Vec<DrainedMetric>,
}

impl FrozenGeneration {
    /// Drained metrics, in ascending `metric_id` order (so D/E/F/G writers,
    /// which require monotone key insertion, can iterate directly).
    pub fn metrics(&self) -> &[DrainedMetric] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The concurrent write buffer: see module docs.
pub struct MemoryDatabase {
    root: Arc<Root>,
    generation: AtomicU64,
    bytes_used: AtomicU64,
    byte_budget: u64,
}

impl MemoryDatabase {
    pub fn new(byte_budget: u64) -> Self {
        Self {
            root: Arc::new(Root::default()),
            generation: AtomicU64::new(0),
            bytes_used: AtomicU64::new(0),
            byte_budget,
        }
    }

    /// Returns the metric's store, creating it (under a brief write lock)
    /// the first time it's seen. Once created a metric's store lives for the
    /// lifetime of the database; it is never removed or replaced.
    fn metric_store_or_create(&self, metric_id: MetricId) -> Arc<MetricStore> {
        if let Some(store) = self.root.metrics.read().get(&metric_id) {
            return Arc::clone(store);
        }
        let mut metrics = self.root.metrics.write();
        Arc::clone(
            metrics
                .entry(metric_id)
                .or_insert_with(|| Arc::new(MetricStore::new(metric_id))),
        )
    }

    fn find_metric(&self, metric_id: MetricId) -> Option<Arc<MetricStore>> {
        self.root.metrics.read().get(&metric_id).cloned()
    }

    /// Every metric ever seen by this database, in ascending `metric_id`
    /// order, regardless of whether it has unflushed points. The persistent
    /// identity layer (`Root`) never forgets a metric once created, so this
    /// is what the Tag KV Index writer rebuilds a full snapshot from on
    /// every flush.
    pub fn all_metrics(&self) -> Vec<(MetricId, Arc<MetricStore>)> {
        let metrics = self.root.metrics.read();
        let mut out: Vec<_> = metrics
            .iter()
            .map(|(&id, store)| (id, Arc::clone(store)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Returns a metric's store, creating it if this is the first time it's
    /// been seen by this process. Used by recovery to rehydrate identity
    /// state for a metric that was only ever seen in D/E, never written to
    /// in this process until now.
    pub fn metric_store(&self, metric_id: MetricId) -> Arc<MetricStore> {
        self.metric_store_or_create(metric_id)
    }

    /// Resolves a point's tag-value set to a stable series id. `tags` need
    /// not be pre-sorted by `tag_key_id`.
    pub fn resolve_series(&self, metric_id: MetricId, tags: Vec<(TagKeyId, &str)>) -> SeriesId {
        self.metric_store_or_create(metric_id).resolve_series(tags)
    }

    /// Read-only counterpart to `resolve_series`, used by the query path.
    /// Returns `None` if the metric, or the exact tag combination, has not
    /// been written in the current (unflushed) generation.
    pub fn lookup_series(&self, metric_id: MetricId, tags: Vec<(TagKeyId, &str)>) -> Option<SeriesId> {
        self.find_metric(metric_id)?.lookup_series(tags)
    }

    /// Appends one point. Fails with `ResourceExhausted` once the configured
    /// byte budget is exceeded, so callers can back off and wait for the
    /// next flush.
    pub fn write(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        field_id: FieldId,
        field_type: FieldType,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<()> {
        // A point's real marginal cost is small and hard to pin exactly
        // (merges don't grow the buffer at all); this is a coarse proxy
        // adequate for triggering back-pressure, not an accounting ledger.
        const APPROX_BYTES_PER_POINT: u64 = 16;
        let used = self
            .bytes_used
            .fetch_add(APPROX_BYTES_PER_POINT, Ordering::Relaxed)
            + APPROX_BYTES_PER_POINT;
        if used > self.byte_budget {
            self.bytes_used
                .fetch_sub(APPROX_BYTES_PER_POINT, Ordering::Relaxed);
            return Err(Error::ResourceExhausted {
                current: used,
                budget: self.byte_budget,
            });
        }

        let metric = self.metric_store_or_create(metric_id);
        let series = metric.series_store(series_id).ok_or_else(|| {
            Error::not_found(format!("series id {series_id} in metric {metric_id}"))
        })?;
        series.write(field_id, field_type, timestamp, value)
    }

    /// Replays a previously-accepted point during recovery, accepting the
    /// same shape as `write`. The WAL this replays from is out of scope.
    pub fn replay(&self, point: Point) -> Result<()> {
        self.write(
            point.metric_id,
            point.series_id,
            point.field_id,
            point.field_type,
            point.timestamp,
            point.value,
        )
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    pub fn byte_budget(&self) -> u64 {
        self.byte_budget
    }

    /// Reads freshest points not yet flushed. Read-only; never allocates a
    /// metric or series that doesn't already exist.
    pub fn query(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        field_id: FieldId,
        range: (Timestamp, Timestamp),
    ) -> Vec<(Timestamp, Sample)> {
        let Some(metric) = self.find_metric(metric_id) else {
            return Vec::new();
        };
        let Some(series) = metric.series_store(series_id) else {
            return Vec::new();
        };
        let snapshot = series.snapshot();
        match snapshot.get(&field_id) {
            Some((_, column)) => column.range(range.0, range.1),
            None => Vec::new(),
        }
    }

    /// Drains every series' accumulated columns into a `FrozenGeneration`
    /// for the flush worker to write out as D/E/F/G, leaving each field's
    /// buffer empty but its identity (series id, tag-value ids, field type)
    /// untouched. Each series is drained under only its own lock, so this
    /// never blocks a concurrent writer touching a different series.
    pub fn freeze(&self) -> FrozenGeneration {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let mut entries = Vec::new();
        let metrics = self.root.metrics.read();
        let mut metric_ids: Vec<_> = metrics.keys().copied().collect();
        metric_ids.sort_unstable();
        for metric_id in metric_ids {
            let metric = Arc::clone(&metrics[&metric_id]);
            let mut drained_series = Vec::new();
            for (series_id, series_store) in metric.series_snapshot() {
                let drained = series_store.drain();
                if !drained.is_empty() {
                    drained_series.push((series_id, drained));
                }
            }
            if !drained_series.is_empty() {
                entries.push((metric_id, metric, drained_series));
            }
        }
        drop(metrics);
        self.bytes_used.store(0, Ordering::Relaxed);
        FrozenGeneration { generation, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldType;

    #[test]
    fn write_then_query_sees_the_point() {
        let db = MemoryDatabase::new(1024 * 1024);
        let series = db.resolve_series(0, vec![(0, "a")]);
        db.write(0, series, 0, FieldType::Sum, 1000, 0.5).unwrap();

        let result = db.query(0, series, 0, (0, 2000));
        assert_eq!(result, vec![(1000, Sample::Scalar(0.5))]);
    }

    #[test]
    fn resource_exhaustion_is_reported() {
        let db = MemoryDatabase::new(32);
        let series = db.resolve_series(0, vec![(0, "a")]);
        let mut failed = false;
        for i in 0..10 {
            if db
                .write(0, series, 0, FieldType::Sum, i, i as f64)
                .is_err()
            {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn freeze_drains_buffers_but_keeps_series_identity_stable() {
        let db = MemoryDatabase::new(1024 * 1024);
        let series = db.resolve_series(0, vec![(0, "a")]);
        db.write(0, series, 0, FieldType::Sum, 1000, 1.0).unwrap();

        let frozen = db.freeze();
        assert_eq!(frozen.generation, 0);
        assert_eq!(frozen.metrics().len(), 1);
        let (metric_id, _metric, drained_series) = &frozen.metrics()[0];
        assert_eq!(*metric_id, 0);
        assert_eq!(drained_series[0].0, series);

        // The drained buffer is empty, and the byte budget resets...
        assert!(db.query(0, series, 0, (0, 2000)).is_empty());
        assert_eq!(db.bytes_used(), 0);

        // ...but resolving the very same tag combination again still finds
        // the same series id, because identity lives in `Root`, not in the
        // drained buffer.
        assert_eq!(db.resolve_series(0, vec![(0, "a")]), series);

        let new_series = db.resolve_series(0, vec![(0, "b")]);
        assert_ne!(new_series, series);
        db.write(0, new_series, 0, FieldType::Sum, 2000, 2.0)
            .unwrap();
        assert_eq!(
            db.query(0, new_series, 0, (0, 3000)),
            vec![(2000, Sample::Scalar(2.0))]
        );
    }

    #[test]
    fn second_freeze_omits_series_with_no_new_points() {
        let db = MemoryDatabase::new(1024 * 1024);
        let series = db.resolve_series(0, vec![(0, "a")]);
        db.write(0, series, 0, FieldType::Sum, 1000, 1.0).unwrap();
        let first = db.freeze();
        assert_eq!(first.metrics().len(), 1);

        // Nothing written since the first freeze: the metric contributed no
        // new points, so the second generation is empty.
        let second = db.freeze();
        assert!(second.is_empty());
    }
}
