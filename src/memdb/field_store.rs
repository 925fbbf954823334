//! Leaf of the MemoryDatabase hierarchy: a small append buffer for one
//! field's points, merging same-timestamp collisions as they arrive.

use crate::tables::ColumnWriter;
use crate::{FieldType, Timestamp};

#[derive(Debug)]
pub struct FieldStore {
    field_type: FieldType,
    column: ColumnWriter,
}

impl FieldStore {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            column: ColumnWriter::new(),
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn push(&mut self, ts: Timestamp, value: f64) {
        self.column.push_scalar(self.field_type, ts, value);
    }

    pub fn len(&self) -> usize {
        self.column.len()
    }

    pub fn is_empty(&self) -> bool {
        self.column.is_empty()
    }

    pub fn column(&self) -> &ColumnWriter {
        &self.column
    }

    /// Takes the accumulated column, leaving an empty one in its place so
    /// the field keeps accepting writes (and keeps rejecting type changes)
    /// across the flush that drains it.
    pub fn drain(&mut self) -> ColumnWriter {
        std::mem::take(&mut self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_same_timestamp_writes() {
        let mut store = FieldStore::new(FieldType::Sum);
        store.push(1000, 1.0);
        store.push(1000, 2.0);
        assert_eq!(store.len(), 1);
    }
}
