//! Middle tier of the MemoryDatabase hierarchy: one time series' fields,
//! addressed by `field_id`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::memdb::field_store::FieldStore;
use crate::{FieldId, FieldType, Timestamp};

#[derive(Default)]
pub struct TimeSeriesStore {
    fields: Mutex<HashMap<FieldId, FieldStore>>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one point, creating the field's buffer on first sight.
    /// Fails with `MalformedInput` if `field_id` was already written with a
    /// different `field_type` in this generation.
    pub fn write(&self, field_id: FieldId, field_type: FieldType, ts: Timestamp, value: f64) -> Result<()> {
        let mut fields = self.fields.lock();
        let store = fields
            .entry(field_id)
            .or_insert_with(|| FieldStore::new(field_type));
        if store.field_type() != field_type {
            return Err(Error::malformed(format!(
                "field id {field_id} already buffered as {:?}, cannot write as {field_type:?}",
                store.field_type()
            )));
        }
        store.push(ts, value);
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.fields.lock().values().map(FieldStore::len).sum()
    }

    /// Snapshot of every field's accumulated column, used by the flush path.
    pub fn snapshot(&self) -> HashMap<FieldId, (FieldType, crate::tables::ColumnWriter)> {
        self.fields
            .lock()
            .iter()
            .map(|(&field_id, store)| (field_id, (store.field_type(), store.column().clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.lock().is_empty()
    }

    /// Takes every field's accumulated column for the flush path, leaving
    /// each field's buffer empty (but its type still registered) so writes
    /// racing the flush land cleanly in the next generation.
    pub fn drain(&self) -> HashMap<FieldId, (FieldType, crate::tables::ColumnWriter)> {
        self.fields
            .lock()
            .iter_mut()
            .map(|(&field_id, store)| (field_id, (store.field_type(), store.drain())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_field_type_change_mid_generation() {
        let store = TimeSeriesStore::new();
        store.write(0, FieldType::Sum, 1000, 1.0).unwrap();
        let err = store.write(0, FieldType::Max, 2000, 2.0).unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn snapshot_reflects_all_fields() {
        let store = TimeSeriesStore::new();
        store.write(0, FieldType::Sum, 1000, 1.0).unwrap();
        store.write(1, FieldType::Last, 1000, 2.0).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
    }
}
