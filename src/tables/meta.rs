//! Metric-Meta Index Table.
//!
//! A KV Table keyed by `metric_id`. Each value holds a tag-key meta section,
//! a field meta section, and a `pos_of_field` pointer so a reader can jump
//! straight to field meta without walking the tag-key section first.
//!
//! Resolved open question (recorded in DESIGN.md): `pos_of_field` is
//! relative to the start of this *value* (the entry), not absolute in the
//! file — so a value can be relocated by compaction without rewriting its
//! internal offset.

use crate::codec::{read_bytes, read_uvarint, write_bytes, write_uvarint};
use crate::error::{Error, Result};
use crate::kv::{KvTableReader, KvTableWriter};
use crate::{FieldId, FieldType, MetricId, TagKeyId};

#[derive(Debug, Clone, PartialEq)]
pub struct TagKeyMeta {
    pub name: String,
    pub tag_key_id: TagKeyId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: FieldType,
    pub field_id: FieldId,
}

/// Builds one Metric-Meta Index Table generation.
pub struct MetaTableWriter {
    entries: Vec<(MetricId, Vec<TagKeyMeta>, Vec<FieldMeta>)>,
}

impl MetaTableWriter {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Metrics must be pushed in ascending `metric_id` order, the writer
    /// contract shared by every KV Table.
    pub fn push(&mut self, metric_id: MetricId, tag_keys: Vec<TagKeyMeta>, fields: Vec<FieldMeta>) {
        self.entries.push((metric_id, tag_keys, fields));
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let mut table = KvTableWriter::new();
        for (metric_id, tag_keys, fields) in &self.entries {
            let value = encode_entry(tag_keys, fields)?;
            table.insert(*metric_id, &value)?;
        }
        table.finish()
    }
}

impl Default for MetaTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_entry(tag_keys: &[TagKeyMeta], fields: &[FieldMeta]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    // Tag-key meta section: (name_len: u8, name, tag_key_id: u32)*
    for tk in tag_keys {
        let name_len = u8::try_from(tk.name.len())
            .map_err(|_| Error::malformed("tag key name longer than 255 bytes"))?;
        buf.push(name_len);
        buf.extend_from_slice(tk.name.as_bytes());
        buf.extend_from_slice(&tk.tag_key_id.to_le_bytes());
    }

    // pos_of_field is relative to the start of this entry.
    let pos_of_field = buf.len() as u32;

    // Field meta section: count-prefixed (name_len: uvarint, name, type: u8, id: u16)*
    write_uvarint(&mut buf, fields.len() as u64)?;
    for f in fields {
        write_bytes(&mut buf, f.name.as_bytes())?;
        buf.push(f.field_type.as_u8());
        buf.extend_from_slice(&f.field_id.to_le_bytes());
    }

    buf.extend_from_slice(&pos_of_field.to_le_bytes());
    Ok(buf)
}

/// Read-only view over one Metric-Meta entry's bytes.
pub struct MetaEntry<'a> {
    bytes: &'a [u8],
    pos_of_field: usize,
}

impl<'a> MetaEntry<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::corrupted(
                "<metric-meta>",
                "entry shorter than the pos_of_field trailer",
            ));
        }
        let pos_of_field_bytes = &bytes[bytes.len() - 4..];
        let pos_of_field = u32::from_le_bytes(pos_of_field_bytes.try_into().unwrap()) as usize;
        if pos_of_field > bytes.len() - 4 {
            return Err(Error::corrupted(
                "<metric-meta>",
                "pos_of_field points past the end of the entry",
            ));
        }
        Ok(Self { bytes, pos_of_field })
    }

    /// Jumps straight to field meta without decoding the tag-key section.
    pub fn fields(&self) -> Result<Vec<FieldMeta>> {
        let mut cursor = &self.bytes[self.pos_of_field..self.bytes.len() - 4];
        let count = read_uvarint(&mut cursor)? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let name_bytes = read_bytes(&mut cursor)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| Error::corrupted("<metric-meta>", "field name not valid UTF-8"))?;
            let mut type_byte = [0u8; 1];
            std::io::Read::read_exact(&mut cursor, &mut type_byte)
                .map_err(|e| Error::io("<metric-meta>", e))?;
            let field_type = FieldType::from_u8(type_byte[0])
                .ok_or_else(|| Error::corrupted("<metric-meta>", "unknown field type byte"))?;
            let mut id_bytes = [0u8; 2];
            std::io::Read::read_exact(&mut cursor, &mut id_bytes)
                .map_err(|e| Error::io("<metric-meta>", e))?;
            let field_id = u16::from_le_bytes(id_bytes);
            out.push(FieldMeta {
                name,
                field_type,
                field_id,
            });
        }
        Ok(out)
    }

    pub fn tag_keys(&self) -> Result<Vec<TagKeyMeta>> {
        let mut cursor = &self.bytes[..self.pos_of_field];
        let mut out = Vec::new();
        while !cursor.is_empty() {
            let mut len_byte = [0u8; 1];
            std::io::Read::read_exact(&mut cursor, &mut len_byte)
                .map_err(|e| Error::io("<metric-meta>", e))?;
            let name_len = len_byte[0] as usize;
            if cursor.len() < name_len + 4 {
                return Err(Error::corrupted("<metric-meta>", "truncated tag key entry"));
            }
            let (name_bytes, rest) = cursor.split_at(name_len);
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| Error::corrupted("<metric-meta>", "tag key name not valid UTF-8"))?
                .to_string();
            let tag_key_id = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            cursor = &rest[4..];
            out.push(TagKeyMeta { name, tag_key_id });
        }
        Ok(out)
    }
}

/// Read-only view over a whole Metric-Meta Index Table generation.
pub struct MetaTableReader<'a> {
    table: KvTableReader<'a>,
}

impl<'a> MetaTableReader<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        Ok(Self {
            table: KvTableReader::from_bytes(bytes)?,
        })
    }

    pub fn get(&self, metric_id: MetricId) -> Result<Option<MetaEntry<'a>>> {
        match self.table.get(metric_id)? {
            Some(bytes) => Ok(Some(MetaEntry::parse(bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries in ascending `metric_id` order, used by recovery to
    /// rehydrate every metric's tag-key and field definitions.
    pub fn iter(&self) -> impl Iterator<Item = (MetricId, Result<MetaEntry<'a>>)> + '_ {
        self.table
            .iter()
            .map(|(metric_id, bytes)| (metric_id, MetaEntry::parse(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tag_keys_and_fields() {
        let mut w = MetaTableWriter::new();
        w.push(
            0,
            vec![
                TagKeyMeta {
                    name: "host".to_string(),
                    tag_key_id: 0,
                },
                TagKeyMeta {
                    name: "region".to_string(),
                    tag_key_id: 1,
                },
            ],
            vec![FieldMeta {
                name: "usage".to_string(),
                field_type: FieldType::Sum,
                field_id: 0,
            }],
        );
        let bytes = w.finish().unwrap();

        let reader = MetaTableReader::from_bytes(&bytes).unwrap();
        let entry = reader.get(0).unwrap().expect("metric 0 present");
        let fields = entry.fields().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "usage");
        assert_eq!(fields[0].field_type, FieldType::Sum);

        let tag_keys = entry.tag_keys().unwrap();
        assert_eq!(tag_keys.len(), 2);
        assert_eq!(tag_keys[0].name, "host");
        assert_eq!(tag_keys[1].name, "region");

        assert!(reader.get(1).unwrap().is_none());
    }

    #[test]
    fn field_meta_is_reachable_without_decoding_tag_keys() {
        let mut w = MetaTableWriter::new();
        w.push(
            5,
            vec![TagKeyMeta {
                name: "a_very_long_tag_key_name_to_pad_the_section".to_string(),
                tag_key_id: 0,
            }],
            vec![FieldMeta {
                name: "v".to_string(),
                field_type: FieldType::Last,
                field_id: 2,
            }],
        );
        let bytes = w.finish().unwrap();
        let reader = MetaTableReader::from_bytes(&bytes).unwrap();
        let entry = reader.get(5).unwrap().unwrap();
        // Calling fields() directly, without ever calling tag_keys(), must work.
        let fields = entry.fields().unwrap();
        assert_eq!(fields[0].field_id, 2);
    }
}
