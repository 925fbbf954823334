//! Metric-NameID Index Table.
//!
//! One KV Table file holding a single entry: a gzip-compressed stream of
//! `(name_length, name, metric_id)` records in metric-id order, followed by
//! the 8-byte sequence trailer (`next_metric_id`, `next_tag_key_id`).
//! Wrapping this in a one-entry KV Table, rather than a bespoke file format,
//! means this family gets the same 24-byte footer/CRC32 contract every other
//! family shares for free.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::codec::{read_uvarint, write_uvarint};
use crate::error::{Error, Result};
use crate::kv::{KvTableReader, KvTableWriter};
use crate::MetricId;

/// The single key every Metric-NameID Index Table entry is stored under.
const ENTRY_KEY: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct NameIdRecord {
    pub name: String,
    pub metric_id: MetricId,
}

/// Builds one Metric-NameID Index Table generation from the full
/// `(name -> metric_id)` map known to the Sequencer at flush time. Diffs are
/// not supported, to keep the file format simple.
pub struct NameIdTableWriter {
    records: Vec<NameIdRecord>,
}

impl NameIdTableWriter {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Records must be pushed in ascending `metric_id` order, which is also
    /// their original insertion order since ids are assigned in allocation
    /// order.
    pub fn push(&mut self, name: impl Into<String>, metric_id: MetricId) {
        self.records.push(NameIdRecord {
            name: name.into(),
            metric_id,
        });
    }

    pub fn finish(
        self,
        next_metric_id: u32,
        next_tag_key_id: u32,
    ) -> Result<Vec<u8>> {
        let mut plain = Vec::new();
        for record in &self.records {
            write_uvarint(&mut plain, record.name.len() as u64)?;
            plain.extend_from_slice(record.name.as_bytes());
            plain.extend_from_slice(&record.metric_id.to_le_bytes());
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&plain)
            .map_err(|e| Error::io("<gzip>", e))?;
        let compressed = encoder.finish().map_err(|e| Error::io("<gzip>", e))?;

        let mut value = Vec::with_capacity(compressed.len() + 8);
        write_uvarint(&mut value, compressed.len() as u64)?;
        value.extend_from_slice(&compressed);
        value.extend_from_slice(&next_metric_id.to_le_bytes());
        value.extend_from_slice(&next_tag_key_id.to_le_bytes());

        let mut table = KvTableWriter::new();
        table.insert(ENTRY_KEY, &value)?;
        table.finish()
    }
}

impl Default for NameIdTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view over a Metric-NameID Index Table generation's bytes.
///
/// The gzip payload is fully decompressed into owned records at load time
/// (recovery only needs to do this once per generation), so this holds no
/// borrow into the source bytes.
pub struct NameIdTableReader {
    records: Vec<NameIdRecord>,
    pub next_metric_id: u32,
    pub next_tag_key_id: u32,
}

impl NameIdTableReader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let table = KvTableReader::from_bytes(bytes)?;
        let value = table
            .get(ENTRY_KEY)?
            .ok_or_else(|| Error::corrupted(
                "<metric-nameid>",
                "missing the single expected entry",
            ))?;

        let mut cursor = value;
        let compressed_len = read_uvarint(&mut cursor)? as usize;
        if cursor.len() < compressed_len + 8 {
            return Err(Error::corrupted(
                "<metric-nameid>",
                "value shorter than compressed payload plus trailer",
            ));
        }
        let (compressed, rest) = cursor.split_at(compressed_len);
        let next_metric_id = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let next_tag_key_id = u32::from_le_bytes(rest[4..8].try_into().unwrap());

        let mut plain = Vec::new();
        GzDecoder::new(compressed)
            .read_to_end(&mut plain)
            .map_err(|e| Error::io("<gzip>", e))?;

        let mut records = Vec::new();
        let mut p = &plain[..];
        while !p.is_empty() {
            let name_len = read_uvarint(&mut p)? as usize;
            if p.len() < name_len + 4 {
                return Err(Error::corrupted(
                    "<metric-nameid>",
                    "truncated record in decompressed payload",
                ));
            }
            let (name_bytes, rest) = p.split_at(name_len);
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| Error::corrupted("<metric-nameid>", "metric name not valid UTF-8"))?
                .to_string();
            let metric_id = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            p = &rest[4..];
            records.push(NameIdRecord { name, metric_id });
        }

        Ok(Self {
            records,
            next_metric_id,
            next_tag_key_id,
        })
    }

    pub fn records(&self) -> &[NameIdRecord] {
        &self.records
    }

    pub fn lookup(&self, name: &str) -> Option<MetricId> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.metric_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_generation_round_trips() {
        let w = NameIdTableWriter::new();
        let bytes = w.finish(0, 0).unwrap();
        let reader = NameIdTableReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.next_metric_id, 0);
        assert!(reader.records().is_empty());
    }

    #[test]
    fn round_trips_records_and_trailer() {
        let mut w = NameIdTableWriter::new();
        w.push("cpu", 0);
        w.push("memory", 1);
        w.push("disk", 2);
        let bytes = w.finish(3, 7).unwrap();

        let reader = NameIdTableReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.next_metric_id, 3);
        assert_eq!(reader.next_tag_key_id, 7);
        assert_eq!(reader.lookup("cpu"), Some(0));
        assert_eq!(reader.lookup("memory"), Some(1));
        assert_eq!(reader.lookup("missing"), None);
        assert_eq!(reader.records().len(), 3);
    }

    #[test]
    fn corrupted_footer_is_detected() {
        let mut w = NameIdTableWriter::new();
        w.push("cpu", 0);
        let mut bytes = w.finish(1, 0).unwrap();
        bytes[0] ^= 0xff;
        assert!(NameIdTableReader::from_bytes(&bytes).is_err());
    }
}
