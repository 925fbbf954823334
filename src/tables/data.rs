//! Metric Data Table: the column store, nested four levels deep.
//!
//! Level 1 (file) is an ordinary KV Table (`crate::kv`) keyed by `metric_id`,
//! whose values are Level 2 metric blocks. Level 2 groups a metric's series
//! into Series Buckets by the high 16 bits of `series_id`; Level 3 is one
//! such bucket, holding Series Entries addressed by the low 16 bits; Level 4
//! is a Series Entry, one column per active field.
//!
//! Resolved open question (recorded in DESIGN.md): Level 2 names a "Series
//! Bitmap" of present series-ids but no separate high-key bitmap for ranking
//! into the HighKey Offsets array. Rather than persist a redundant bitmap,
//! readers derive the high-key set from the Series Bitmap itself (each
//! present id's top 16 bits, deduplicated) at lookup time; the same trick
//! gives Level 3 its local low-key ranking from the slice of ids sharing a
//! high key. Both derivations are pure set projections, cheap relative to the
//! I/O already paid to reach this block.

use std::collections::BTreeMap;

use crate::codec::{crc32_of, read_u32_le, u32_le_at, write_u32_le, Bitmap};
use crate::error::{Error, Result};
use crate::kv::{KvTableReader, KvTableWriter};
use crate::tables::{Column, ColumnWriter};
use crate::{FieldId, FieldType, MetricId, SeriesId, Timestamp};

const METRIC_FOOTER_LEN: usize = 24;

fn high16(series_id: SeriesId) -> u32 {
    series_id >> 16
}

fn low16(series_id: SeriesId) -> u32 {
    series_id & 0xffff
}

/// Accumulates one metric's series for a single Metric Data file generation.
pub struct MetricBlockBuilder {
    metric_id: MetricId,
    time_range: (Timestamp, Timestamp),
    fields_meta: Vec<(FieldId, FieldType)>,
    series: BTreeMap<SeriesId, BTreeMap<FieldId, ColumnWriter>>,
}

impl MetricBlockBuilder {
    pub fn new(
        metric_id: MetricId,
        time_range: (Timestamp, Timestamp),
        fields_meta: Vec<(FieldId, FieldType)>,
    ) -> Self {
        Self {
            metric_id,
            time_range,
            fields_meta,
            series: BTreeMap::new(),
        }
    }

    pub fn series_mut(&mut self, series_id: SeriesId) -> &mut BTreeMap<FieldId, ColumnWriter> {
        self.series.entry(series_id).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Builds one Metric Data Table generation, covering one time family.
pub struct DataTableWriter {
    metrics: Vec<MetricBlockBuilder>,
}

impl DataTableWriter {
    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
        }
    }

    /// Metric blocks must be pushed in ascending `metric_id` order, the
    /// writer contract inherited from the Level 1 KV Table.
    pub fn push(&mut self, block: MetricBlockBuilder) {
        self.metrics.push(block);
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let mut table = KvTableWriter::new();
        for block in &self.metrics {
            let value = encode_metric_block(block)?;
            table.insert(block.metric_id, &value)?;
        }
        table.finish()
    }
}

impl Default for DataTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_series_entry(
    fields_meta: &[(FieldId, FieldType)],
    columns: &BTreeMap<FieldId, ColumnWriter>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut offsets = Vec::with_capacity(fields_meta.len());
    for (field_id, _field_type) in fields_meta {
        offsets.push(buf.len() as u32);
        match columns.get(field_id) {
            Some(column) => column.write_to(&mut buf)?,
            None => {
                // No samples for this field in this series/file: an empty
                // column (count 0), still addressable like any other.
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(&0u64.to_le_bytes());
            }
        }
    }
    for offset in offsets {
        write_u32_le(&mut buf, offset)?;
    }
    Ok(buf)
}

fn encode_series_bucket(
    fields_meta: &[(FieldId, FieldType)],
    bucket_series: &BTreeMap<SeriesId, &BTreeMap<FieldId, ColumnWriter>>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut offsets = Vec::with_capacity(bucket_series.len());
    for columns in bucket_series.values() {
        offsets.push(buf.len() as u32);
        let entry = encode_series_entry(fields_meta, columns)?;
        buf.extend_from_slice(&entry);
    }
    for offset in offsets {
        write_u32_le(&mut buf, offset)?;
    }
    Ok(buf)
}

fn encode_metric_block(block: &MetricBlockBuilder) -> Result<Vec<u8>> {
    let mut buckets: BTreeMap<u32, BTreeMap<SeriesId, &BTreeMap<FieldId, ColumnWriter>>> =
        BTreeMap::new();
    for (series_id, columns) in &block.series {
        buckets
            .entry(high16(*series_id))
            .or_default()
            .insert(*series_id, columns);
    }

    let mut buf = Vec::new();
    let mut highkey_offsets = Vec::with_capacity(buckets.len());
    for bucket_series in buckets.values() {
        highkey_offsets.push(buf.len() as u32);
        let bucket = encode_series_bucket(&block.fields_meta, bucket_series)?;
        buf.extend_from_slice(&bucket);
    }

    let pos_of_metas = buf.len() as u32;
    let field_count = u8::try_from(block.fields_meta.len())
        .map_err(|_| Error::malformed("metric has more than 255 active fields"))?;
    buf.push(field_count);
    for (field_id, field_type) in &block.fields_meta {
        buf.extend_from_slice(&field_id.to_le_bytes());
        buf.push(field_type.as_u8());
    }

    let pos_of_bitmap = buf.len() as u32;
    let series_bitmap: Bitmap = block.series.keys().copied().collect();
    series_bitmap.write_to(&mut buf)?;

    let pos_of_offsets = buf.len() as u32;
    for offset in &highkey_offsets {
        write_u32_le(&mut buf, *offset)?;
    }

    write_u32_le(&mut buf, block.time_range.0 as u32)?;
    write_u32_le(&mut buf, block.time_range.1 as u32)?;
    write_u32_le(&mut buf, pos_of_metas)?;
    write_u32_le(&mut buf, pos_of_bitmap)?;
    write_u32_le(&mut buf, pos_of_offsets)?;
    let crc = crc32_of(&buf);
    write_u32_le(&mut buf, crc)?;

    Ok(buf)
}

/// Read-only view over one metric's Level 2 block.
pub struct MetricBlock<'a> {
    bytes: &'a [u8],
    time_range: (Timestamp, Timestamp),
    pos_of_metas: usize,
    pos_of_bitmap: usize,
    pos_of_offsets: usize,
}

impl<'a> MetricBlock<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < METRIC_FOOTER_LEN {
            return Err(Error::corrupted(
                "<metric-data>",
                "metric block shorter than its 24-byte footer",
            ));
        }
        let footer_start = bytes.len() - METRIC_FOOTER_LEN;
        let mut cursor = &bytes[footer_start..];
        let time_start = read_u32_le(&mut cursor)? as Timestamp;
        let time_end = read_u32_le(&mut cursor)? as Timestamp;
        let pos_of_metas = read_u32_le(&mut cursor)? as usize;
        let pos_of_bitmap = read_u32_le(&mut cursor)? as usize;
        let pos_of_offsets = read_u32_le(&mut cursor)? as usize;
        let stored_crc = read_u32_le(&mut cursor)?;

        let computed_crc = crc32_of(&bytes[..bytes.len() - 4]);
        if computed_crc != stored_crc {
            return Err(Error::corrupted(
                "<metric-data>",
                format!(
                    "metric block CRC32 mismatch: stored {stored_crc:#x}, computed {computed_crc:#x}"
                ),
            ));
        }

        Ok(Self {
            bytes,
            time_range: (time_start, time_end),
            pos_of_metas,
            pos_of_bitmap,
            pos_of_offsets,
        })
    }

    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        self.time_range
    }

    pub fn fields_meta(&self) -> Result<Vec<(FieldId, FieldType)>> {
        let region = &self.bytes[self.pos_of_metas..self.pos_of_bitmap];
        let count = *region
            .first()
            .ok_or_else(|| Error::corrupted("<metric-data>", "missing fields meta count byte"))?;
        let mut out = Vec::with_capacity(count as usize);
        let mut pos = 1usize;
        for _ in 0..count {
            if pos + 3 > region.len() {
                return Err(Error::corrupted("<metric-data>", "truncated fields meta entry"));
            }
            let field_id = u16::from_le_bytes(region[pos..pos + 2].try_into().unwrap());
            let field_type = FieldType::from_u8(region[pos + 2])
                .ok_or_else(|| Error::corrupted("<metric-data>", "unknown field type byte"))?;
            out.push((field_id, field_type));
            pos += 3;
        }
        Ok(out)
    }

    pub fn series_bitmap(&self) -> Result<Bitmap> {
        let mut cursor = &self.bytes[self.pos_of_bitmap..self.pos_of_offsets];
        Bitmap::read_from(&mut cursor)
    }

    fn footer_start(&self) -> usize {
        self.bytes.len() - METRIC_FOOTER_LEN
    }

    /// Decodes one field's column for one series, walking all four levels.
    pub fn lookup(&self, series_id: SeriesId, field_id: FieldId) -> Result<Option<Column>> {
        let series_bitmap = self.series_bitmap()?;
        if !series_bitmap.contains(series_id) {
            return Ok(None);
        }

        let high = high16(series_id);
        let highkeys: Bitmap = series_bitmap.iter().map(high16).collect();
        let high_rank = highkeys
            .rank_of(high)
            .ok_or_else(|| Error::corrupted("<metric-data>", "series present but high key missing from derived set"))?;

        let highkey_offsets_region = &self.bytes[self.pos_of_offsets..self.footer_start()];
        let highkey_count = highkeys.len() as usize;
        if highkey_offsets_region.len() != highkey_count * 4 {
            return Err(Error::corrupted(
                "<metric-data>",
                "high-key offsets array length disagrees with the derived high-key set",
            ));
        }
        let bucket_start = u32_le_at(highkey_offsets_region, high_rank as usize * 4)? as usize;
        let bucket_end = if (high_rank as usize + 1) < highkey_count {
            u32_le_at(highkey_offsets_region, (high_rank as usize + 1) * 4)? as usize
        } else {
            self.pos_of_metas
        };
        let bucket_bytes = &self.bytes[bucket_start..bucket_end];

        let low = low16(series_id);
        let local_lows: Bitmap = series_bitmap
            .iter()
            .filter(|s| high16(*s) == high)
            .map(low16)
            .collect();
        let local_rank = local_lows
            .rank_of(low)
            .ok_or_else(|| Error::corrupted("<metric-data>", "series present but low key missing from bucket's derived set"))?;
        let local_count = local_lows.len() as usize;

        if bucket_bytes.len() < local_count * 4 {
            return Err(Error::corrupted(
                "<metric-data>",
                "series bucket shorter than its low-key offsets array",
            ));
        }
        let offsets_region_start = bucket_bytes.len() - local_count * 4;
        let offsets_region = &bucket_bytes[offsets_region_start..];
        let entry_start = u32_le_at(offsets_region, local_rank as usize * 4)? as usize;
        let entry_end = if (local_rank as usize + 1) < local_count {
            u32_le_at(offsets_region, (local_rank as usize + 1) * 4)? as usize
        } else {
            offsets_region_start
        };
        let entry_bytes = &bucket_bytes[entry_start..entry_end];

        let fields_meta = self.fields_meta()?;
        // A field absent from this generation's Fields Meta wasn't defined
        // yet when this file was flushed — not corruption, just no data
        // for it here; the caller merges across generations to fill it in.
        let Some(field_index) = fields_meta.iter().position(|(id, _)| *id == field_id) else {
            return Ok(None);
        };
        let field_count = fields_meta.len();

        if entry_bytes.len() < field_count * 4 {
            return Err(Error::corrupted(
                "<metric-data>",
                "series entry shorter than its field offsets array",
            ));
        }
        let entry_offsets_start = entry_bytes.len() - field_count * 4;
        let entry_offsets_region = &entry_bytes[entry_offsets_start..];
        let col_start = u32_le_at(entry_offsets_region, field_index * 4)? as usize;
        let col_end = if field_index + 1 < field_count {
            u32_le_at(entry_offsets_region, (field_index + 1) * 4)? as usize
        } else {
            entry_offsets_start
        };
        let col_bytes = &entry_bytes[col_start..col_end];

        let field_type = fields_meta[field_index].1;
        Ok(Some(Column::read_from(col_bytes, field_type)?))
    }
}

/// Read-only view over a whole Metric Data Table generation.
pub struct DataTableReader<'a> {
    table: KvTableReader<'a>,
}

impl<'a> DataTableReader<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        Ok(Self {
            table: KvTableReader::from_bytes(bytes)?,
        })
    }

    pub fn get_metric(&self, metric_id: MetricId) -> Result<Option<MetricBlock<'a>>> {
        match self.table.get(metric_id)? {
            Some(bytes) => Ok(Some(MetricBlock::parse(bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_scalar(block: &mut MetricBlockBuilder, series_id: SeriesId, field_id: FieldId, ts: Timestamp, v: f64) {
        block
            .series_mut(series_id)
            .entry(field_id)
            .or_default()
            .push_scalar(FieldType::Sum, ts, v);
    }

    #[test]
    fn single_series_single_field_round_trips() {
        let mut block = MetricBlockBuilder::new(0, (0, 3600_000), vec![(0, FieldType::Sum)]);
        push_scalar(&mut block, 1, 0, 1000, 0.5);

        let mut w = DataTableWriter::new();
        w.push(block);
        let bytes = w.finish().unwrap();

        let reader = DataTableReader::from_bytes(&bytes).unwrap();
        let metric = reader.get_metric(0).unwrap().expect("metric 0 present");
        let column = metric.lookup(1, 0).unwrap().expect("field present");
        assert_eq!(column.scalar_at(1000), Some(0.5));
        assert_eq!(metric.time_range(), (0, 3600_000));
    }

    #[test]
    fn many_series_across_high_key_boundary_all_resolve() {
        // series ids straddling the 16-bit high/low boundary.
        let series_ids: Vec<SeriesId> = vec![1, 2, 0x1_0000, 0x1_0001, 0x2_ffff];
        let mut block = MetricBlockBuilder::new(7, (0, 100), vec![(0, FieldType::Sum)]);
        for (i, &sid) in series_ids.iter().enumerate() {
            push_scalar(&mut block, sid, 0, 10, i as f64);
        }

        let mut w = DataTableWriter::new();
        w.push(block);
        let bytes = w.finish().unwrap();

        let reader = DataTableReader::from_bytes(&bytes).unwrap();
        let metric = reader.get_metric(7).unwrap().unwrap();
        for (i, &sid) in series_ids.iter().enumerate() {
            let col = metric.lookup(sid, 0).unwrap().expect("series present");
            assert_eq!(col.scalar_at(10), Some(i as f64));
        }
        assert!(metric.lookup(999, 0).unwrap().is_none());
    }

    #[test]
    fn missing_metric_returns_none() {
        let w = DataTableWriter::new();
        let bytes = w.finish().unwrap();
        let reader = DataTableReader::from_bytes(&bytes).unwrap();
        assert!(reader.get_metric(0).unwrap().is_none());
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut block = MetricBlockBuilder::new(0, (0, 100), vec![(0, FieldType::Sum)]);
        push_scalar(&mut block, 1, 0, 10, 1.0);
        let mut w = DataTableWriter::new();
        w.push(block);
        let mut bytes = w.finish().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;

        let outcome = DataTableReader::from_bytes(&bytes)
            .and_then(|r| r.get_metric(0))
            .and_then(|m| m.unwrap().lookup(1, 0));
        assert!(outcome.is_err());
    }
}
