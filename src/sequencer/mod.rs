//! The ID Sequencer: durable monotone allocator for metric ids, tag-key
//! ids, and field ids, and the name→id lookup service.
//!
//! One `Sequencer` is the single process-wide instance per shard: callers
//! hold an `Arc<Sequencer>` and pass it down explicitly rather than
//! reaching for it ambiently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::{FieldId, FieldType, MetricId, TagKeyId};

#[derive(Debug, Clone)]
struct MetricEntry {
    metric_id: MetricId,
    tag_keys: HashMap<String, TagKeyId>,
    next_tag_key_id: TagKeyId,
    fields: HashMap<String, (FieldId, FieldType)>,
    next_field_id: FieldId,
}

impl MetricEntry {
    fn new(metric_id: MetricId) -> Self {
        Self {
            metric_id,
            tag_keys: HashMap::new(),
            next_tag_key_id: 0,
            fields: HashMap::new(),
            next_field_id: 0,
        }
    }
}

/// In-memory mirror of the Metric-NameID Index Table (D), plus per-metric
/// tag-key and field id namespaces.
///
/// Recovery reseeds this structure by replaying the latest D generation:
/// `next_metric_id` becomes `max(last_persisted, observed_ids_in_file)`, so
/// a partially-flushed allocator never rewinds below what's already durable.
pub struct Sequencer {
    inner: Mutex<SequencerInner>,
    next_metric_id: AtomicU32,
}

struct SequencerInner {
    by_name: HashMap<String, MetricEntry>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SequencerInner {
                by_name: HashMap::new(),
            }),
            next_metric_id: AtomicU32::new(0),
        }
    }

    /// Reseeds the allocator from a recovered high-water mark, taking the
    /// maximum with whatever this instance has already allocated so a
    /// replay can never move the counter backwards.
    pub fn reseed_next_metric_id(&self, persisted_high_water_mark: u32) {
        self.next_metric_id
            .fetch_max(persisted_high_water_mark, Ordering::SeqCst);
    }

    /// Re-hydrates a previously persisted `(name -> metric_id)` mapping,
    /// used during recovery before any new allocation happens.
    pub fn restore_metric(&self, name: &str, metric_id: MetricId) {
        let mut inner = self.inner.lock();
        inner
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| MetricEntry::new(metric_id));
        self.next_metric_id
            .fetch_max(metric_id + 1, Ordering::SeqCst);
    }

    pub fn get_or_create_metric_id(&self, name: &str) -> MetricId {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.by_name.get(name) {
            return entry.metric_id;
        }
        // Held under the same lock as the map mutation, so two concurrent
        // callers racing on an unseen name still produce exactly one
        // allocation.
        let id = self.next_metric_id.fetch_add(1, Ordering::SeqCst);
        inner
            .by_name
            .insert(name.to_string(), MetricEntry::new(id));
        id
    }

    pub fn lookup_metric_id(&self, name: &str) -> Option<MetricId> {
        self.inner.lock().by_name.get(name).map(|e| e.metric_id)
    }

    pub fn get_or_create_tag_key_id(&self, metric_id: MetricId, tag_key: &str) -> Result<TagKeyId> {
        let mut inner = self.inner.lock();
        let entry = find_metric_mut(&mut inner, metric_id)?;
        if let Some(&id) = entry.tag_keys.get(tag_key) {
            return Ok(id);
        }
        let id = entry.next_tag_key_id;
        entry.next_tag_key_id += 1;
        entry.tag_keys.insert(tag_key.to_string(), id);
        Ok(id)
    }

    /// Assigns a field id, or returns the existing one if `field_name` is
    /// already known for this metric. Fails with `MalformedInput` if the
    /// field already exists under a conflicting type.
    pub fn get_or_create_field_id(
        &self,
        metric_id: MetricId,
        field_name: &str,
        field_type: FieldType,
    ) -> Result<FieldId> {
        let mut inner = self.inner.lock();
        let entry = find_metric_mut(&mut inner, metric_id)?;
        if let Some(&(id, existing_type)) = entry.fields.get(field_name) {
            if existing_type != field_type {
                return Err(Error::malformed(format!(
                    "field '{field_name}' already exists with type {existing_type:?}, cannot redeclare as {field_type:?}"
                )));
            }
            return Ok(id);
        }
        let id = entry.next_field_id;
        entry.next_field_id = entry
            .next_field_id
            .checked_add(1)
            .ok_or_else(|| Error::malformed("field id space exhausted for this metric"))?;
        entry.fields.insert(field_name.to_string(), (id, field_type));
        Ok(id)
    }

    pub fn lookup_field(&self, metric_id: MetricId, field_name: &str) -> Option<(FieldId, FieldType)> {
        let inner = self.inner.lock();
        inner
            .by_name
            .values()
            .find(|e| e.metric_id == metric_id)
            .and_then(|e| e.fields.get(field_name).copied())
    }

    /// The durable high-water mark to persist in the Metric-NameID Index
    /// Table's trailer on the next flush.
    pub fn next_metric_id_high_water_mark(&self) -> u32 {
        self.next_metric_id.load(Ordering::SeqCst)
    }

    /// Every known `(name, metric_id)` pair, used to serialize a full
    /// Metric-NameID Index Table generation on flush. Diffs are not
    /// supported for this family.
    pub fn all_metrics(&self) -> Vec<(String, MetricId)> {
        let inner = self.inner.lock();
        let mut out: Vec<_> = inner
            .by_name
            .iter()
            .map(|(name, entry)| (name.clone(), entry.metric_id))
            .collect();
        out.sort_by_key(|(_, id)| *id);
        out
    }

    /// One metric's tag-key definitions, in ascending `tag_key_id` order,
    /// used to serialize its Metric-Meta entry.
    pub fn tag_keys_of(&self, metric_id: MetricId) -> Result<Vec<(String, TagKeyId)>> {
        let inner = self.inner.lock();
        let entry = inner
            .by_name
            .values()
            .find(|e| e.metric_id == metric_id)
            .ok_or_else(|| Error::not_found(format!("metric id {metric_id}")))?;
        let mut out: Vec<_> = entry
            .tag_keys
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        out.sort_by_key(|(_, id)| *id);
        Ok(out)
    }

    /// One metric's field definitions, in ascending `field_id` order, used
    /// to serialize its Metric-Meta entry and to order Metric Data columns'
    /// Fields Meta.
    pub fn fields_of(&self, metric_id: MetricId) -> Result<Vec<(String, FieldId, FieldType)>> {
        let inner = self.inner.lock();
        let entry = inner
            .by_name
            .values()
            .find(|e| e.metric_id == metric_id)
            .ok_or_else(|| Error::not_found(format!("metric id {metric_id}")))?;
        let mut out: Vec<_> = entry
            .fields
            .iter()
            .map(|(name, (id, field_type))| (name.clone(), *id, *field_type))
            .collect();
        out.sort_by_key(|(_, id, _)| *id);
        Ok(out)
    }

    /// The next tag-key id a given metric would allocate, for D's per-metric
    /// sequence trailer. Zero for a metric with no tag keys yet.
    pub fn next_tag_key_id_high_water_mark(&self, metric_id: MetricId) -> u32 {
        let inner = self.inner.lock();
        inner
            .by_name
            .values()
            .find(|e| e.metric_id == metric_id)
            .map(|e| e.next_tag_key_id)
            .unwrap_or(0)
    }

    /// Re-hydrates one tag-key definition during recovery, used when
    /// replaying the latest Metric-Meta entry for a metric (the exact
    /// per-metric source of truth; D's trailer only carries a coarse
    /// global high-water mark, see DESIGN.md).
    pub fn restore_tag_key(&self, metric_id: MetricId, name: &str, tag_key_id: TagKeyId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = find_metric_mut(&mut inner, metric_id)?;
        entry.tag_keys.insert(name.to_string(), tag_key_id);
        entry.next_tag_key_id = entry.next_tag_key_id.max(tag_key_id + 1);
        Ok(())
    }

    /// Re-hydrates one field definition during recovery.
    pub fn restore_field(
        &self,
        metric_id: MetricId,
        name: &str,
        field_id: FieldId,
        field_type: FieldType,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = find_metric_mut(&mut inner, metric_id)?;
        entry.fields.insert(name.to_string(), (field_id, field_type));
        entry.next_field_id = entry.next_field_id.max(field_id + 1);
        Ok(())
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_metric_mut(inner: &mut SequencerInner, metric_id: MetricId) -> Result<&mut MetricEntry> {
    inner
        .by_name
        .values_mut()
        .find(|e| e.metric_id == metric_id)
        .ok_or_else(|| Error::not_found(format!("metric id {metric_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocation_is_idempotent_and_stable() {
        let seq = Sequencer::new();
        let id1 = seq.get_or_create_metric_id("cpu");
        let id2 = seq.get_or_create_metric_id("cpu");
        assert_eq!(id1, id2);
        assert_eq!(seq.lookup_metric_id("cpu"), Some(id1));
        assert_eq!(seq.lookup_metric_id("memory"), None);
    }

    #[test]
    fn concurrent_allocation_of_same_name_yields_one_id() {
        let seq = Arc::new(Sequencer::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let seq = Arc::clone(&seq);
            handles.push(thread::spawn(move || seq.get_or_create_metric_id("cpu")));
        }
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
    }

    #[test]
    fn field_type_conflict_is_rejected() {
        let seq = Sequencer::new();
        let metric_id = seq.get_or_create_metric_id("cpu");
        seq.get_or_create_field_id(metric_id, "usage", FieldType::Sum)
            .unwrap();
        let err = seq
            .get_or_create_field_id(metric_id, "usage", FieldType::Max)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn tag_key_ids_are_scoped_per_metric() {
        let seq = Sequencer::new();
        let cpu = seq.get_or_create_metric_id("cpu");
        let mem = seq.get_or_create_metric_id("memory");
        assert_eq!(seq.get_or_create_tag_key_id(cpu, "host").unwrap(), 0);
        assert_eq!(seq.get_or_create_tag_key_id(mem, "host").unwrap(), 0);
        assert_eq!(seq.get_or_create_tag_key_id(cpu, "region").unwrap(), 1);
    }

    #[test]
    fn reseed_never_moves_the_counter_backwards() {
        let seq = Sequencer::new();
        seq.get_or_create_metric_id("a");
        seq.get_or_create_metric_id("b");
        seq.reseed_next_metric_id(0);
        assert_eq!(seq.next_metric_id_high_water_mark(), 2);
        seq.reseed_next_metric_id(10);
        assert_eq!(seq.next_metric_id_high_water_mark(), 10);
    }
}
