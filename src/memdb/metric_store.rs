//! Second tier of the MemoryDatabase hierarchy: one metric's series, plus
//! the tag-value tries and series-identity index that back the Tag KV Index
//! and Metric Data table families at flush time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::codec::Bitmap;
use crate::memdb::series_store::TimeSeriesStore;
use crate::trie::TrieBuilder;
use crate::{MetricId, SeriesId, TagKeyId, TagValueId};

/// A resolved, ordered tag-value decomposition for one series: `(tag_key_id,
/// tag_value_id)` pairs sorted by `tag_key_id`.
pub type TagVector = Vec<(TagKeyId, TagValueId)>;

pub struct MetricStore {
    metric_id: MetricId,
    next_series_id: AtomicU32,
    tag_tries: Mutex<HashMap<TagKeyId, TrieBuilder>>,
    /// Inverted accumulator: for each tag key, which series carry each of
    /// its tag-value ids. Rebuilt into F's per-value bitmaps at flush.
    tag_value_series: Mutex<HashMap<TagKeyId, HashMap<TagValueId, Bitmap>>>,
    series_by_tags: Mutex<HashMap<TagVector, SeriesId>>,
    series_tagsets: Mutex<HashMap<SeriesId, TagVector>>,
    series: RwLock<HashMap<SeriesId, Arc<TimeSeriesStore>>>,
}

impl MetricStore {
    pub fn new(metric_id: MetricId) -> Self {
        Self {
            metric_id,
            next_series_id: AtomicU32::new(0),
            tag_tries: Mutex::new(HashMap::new()),
            tag_value_series: Mutex::new(HashMap::new()),
            series_by_tags: Mutex::new(HashMap::new()),
            series_tagsets: Mutex::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn metric_id(&self) -> MetricId {
        self.metric_id
    }

    /// Resolves `tags` (unsorted, one value per tag key present on this
    /// point) to a stable series id, allocating a new tag-value-id per
    /// unseen value and a new series-id per unseen combination.
    pub fn resolve_series(&self, mut tags: Vec<(TagKeyId, &str)>) -> SeriesId {
        tags.sort_by_key(|(id, _)| *id);

        let tag_vector: TagVector = {
            let mut tries = self.tag_tries.lock();
            tags.iter()
                .map(|(tag_key_id, value)| {
                    let trie = tries.entry(*tag_key_id).or_default();
                    (*tag_key_id, trie.get_or_assign(value))
                })
                .collect()
        };

        if let Some(&series_id) = self.series_by_tags.lock().get(&tag_vector) {
            return series_id;
        }

        // Double-checked: another writer may have raced us between the read
        // above and taking the insertion lock below.
        let mut by_tags = self.series_by_tags.lock();
        if let Some(&series_id) = by_tags.get(&tag_vector) {
            return series_id;
        }

        let series_id = self.next_series_id.fetch_add(1, Ordering::SeqCst);
        by_tags.insert(tag_vector.clone(), series_id);
        self.series_tagsets
            .lock()
            .insert(series_id, tag_vector.clone());
        drop(by_tags);

        let mut inverted = self.tag_value_series.lock();
        for (tag_key_id, tag_value_id) in &tag_vector {
            inverted
                .entry(*tag_key_id)
                .or_default()
                .entry(*tag_value_id)
                .or_default()
                .insert(series_id);
        }
        drop(inverted);

        self.series
            .write()
            .insert(series_id, Arc::new(TimeSeriesStore::new()));

        series_id
    }

    /// Read-only counterpart to `resolve_series`: looks up a tag combination
    /// without assigning new tag-value or series ids, for the query path
    /// which must not mutate state behind a reader's back.
    pub fn lookup_series(&self, mut tags: Vec<(TagKeyId, &str)>) -> Option<SeriesId> {
        tags.sort_by_key(|(id, _)| *id);
        let tries = self.tag_tries.lock();
        let mut tag_vector = TagVector::with_capacity(tags.len());
        for (tag_key_id, value) in &tags {
            let id = tries.get(tag_key_id)?.get(value)?;
            tag_vector.push((*tag_key_id, id));
        }
        drop(tries);
        self.series_by_tags.lock().get(&tag_vector).copied()
    }

    pub fn series_store(&self, series_id: SeriesId) -> Option<Arc<TimeSeriesStore>> {
        self.series.read().get(&series_id).cloned()
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Snapshot of every series' accumulated data, for the Metric Data
    /// writer.
    pub fn series_snapshot(&self) -> Vec<(SeriesId, Arc<TimeSeriesStore>)> {
        self.series
            .read()
            .iter()
            .map(|(&id, store)| (id, Arc::clone(store)))
            .collect()
    }

    /// Per-tag-key `(trie, per-value bitmaps in tag-value-id order, union
    /// bitmap)`, ready for the Tag KV Index writer.
    pub fn tag_index_snapshot(&self) -> Vec<(TagKeyId, TrieBuilder, Vec<Bitmap>, Bitmap)> {
        let tries = self.tag_tries.lock();
        let inverted = self.tag_value_series.lock();
        let mut out: Vec<_> = tries
            .iter()
            .map(|(&tag_key_id, trie)| {
                let empty = HashMap::new();
                let per_value = inverted.get(&tag_key_id).unwrap_or(&empty);
                let mut bitmaps = vec![Bitmap::new(); trie.len()];
                let mut union = Bitmap::new();
                for (_value, id) in trie.sorted_entries() {
                    if let Some(b) = per_value.get(&id) {
                        bitmaps[id as usize] = b.clone();
                        union.union_with(b);
                    }
                }
                (tag_key_id, clone_trie(trie), bitmaps, union)
            })
            .collect();
        out.sort_by_key(|(id, ..)| *id);
        out
    }

    pub fn tag_vector_of(&self, series_id: SeriesId) -> Option<TagVector> {
        self.series_tagsets.lock().get(&series_id).cloned()
    }

    /// Re-hydrates one tag key's trie with its exact persisted `(value, id)`
    /// pairs and next-id counter, used during recovery before any new value
    /// is assigned for this key. Also seeds the inverted per-value series
    /// index so a later `tag_index_snapshot` carries forward the restored
    /// membership even for series that contribute no new points.
    pub fn restore_tag_trie(
        &self,
        tag_key_id: TagKeyId,
        entries: Vec<(String, TagValueId)>,
        next_tag_value_sequence: TagValueId,
        series_for_value: impl Fn(TagValueId) -> crate::error::Result<Bitmap>,
    ) -> crate::error::Result<()> {
        let mut tries = self.tag_tries.lock();
        let trie = tries.entry(tag_key_id).or_default();
        let mut inverted = self.tag_value_series.lock();
        let per_key = inverted.entry(tag_key_id).or_default();
        for (value, id) in entries {
            trie.restore(&value, id);
            if !per_key.contains_key(&id) {
                per_key.insert(id, series_for_value(id)?);
            }
        }
        trie.fast_forward(next_tag_value_sequence);
        Ok(())
    }

    /// Re-hydrates one series' stable identity — its resolved tag vector and
    /// the id it was assigned before a restart — without allocating a new
    /// id. `next_series_id` is bumped past `series_id` so later allocations
    /// never collide with restored ones.
    pub fn restore_series(&self, series_id: SeriesId, tag_vector: TagVector) {
        self.series_by_tags
            .lock()
            .entry(tag_vector.clone())
            .or_insert(series_id);
        self.series_tagsets
            .lock()
            .entry(series_id)
            .or_insert_with(|| tag_vector.clone());
        self.series
            .write()
            .entry(series_id)
            .or_insert_with(|| Arc::new(TimeSeriesStore::new()));
        self.next_series_id
            .fetch_max(series_id + 1, Ordering::SeqCst);
    }
}

/// `TrieBuilder` intentionally has no `Clone` (it is meant to be built once
/// and consumed), so the flush path reconstructs an equivalent builder from
/// its sorted entries rather than mutating the live one out from under
/// concurrent writers.
fn clone_trie(trie: &TrieBuilder) -> TrieBuilder {
    let mut clone = TrieBuilder::new();
    for (value, id) in trie.sorted_entries() {
        clone.restore(value, id);
    }
    clone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tag_combination_resolves_to_same_series() {
        let store = MetricStore::new(0);
        let s1 = store.resolve_series(vec![(0, "a"), (1, "us-east")]);
        let s2 = store.resolve_series(vec![(1, "us-east"), (0, "a")]);
        assert_eq!(s1, s2);
    }

    #[test]
    fn distinct_combinations_get_distinct_series_ids() {
        let store = MetricStore::new(0);
        let s1 = store.resolve_series(vec![(0, "a")]);
        let s2 = store.resolve_series(vec![(0, "b")]);
        assert_ne!(s1, s2);
        assert_eq!(store.series_count(), 2);
    }

    #[test]
    fn tag_index_snapshot_has_correct_union_bitmap() {
        let store = MetricStore::new(0);
        let s1 = store.resolve_series(vec![(0, "a")]);
        let s2 = store.resolve_series(vec![(0, "b")]);
        let snapshot = store.tag_index_snapshot();
        let (_, _, _, union) = &snapshot[0];
        assert!(union.contains(s1));
        assert!(union.contains(s2));
    }
}
