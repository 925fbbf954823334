//! Per-field column codec: the payload addressed by a Series Entry's Field
//! Offsets.
//!
//! Every field type stores `(timestamp, value)` samples as a delta-encoded
//! timestamp plus an `f64`; `histogram` fields additionally carry a bucket
//! list per sample. The field-type only changes how colliding samples at the
//! same timestamp are *merged* (`FieldType::merge`, `crate::lib`) — the
//! on-disk shape is otherwise uniform, which keeps round-trip and durability
//! properties checkable with a single concrete format.

use std::collections::BTreeMap;

use crate::codec::{read_uvarint, write_uvarint};
use crate::error::{Error, Result};
use crate::{FieldType, Timestamp};

/// One decoded sample's value.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Scalar(f64),
    Histogram(Vec<(f64, u64)>),
}

impl Sample {
    fn as_scalar(&self) -> Option<f64> {
        match self {
            Sample::Scalar(v) => Some(*v),
            Sample::Histogram(_) => None,
        }
    }
}

/// Accumulates `(timestamp, value)` samples for one field and encodes them
/// into a column, merging same-timestamp collisions with the field-type's
/// merge function as they arrive.
#[derive(Debug, Default, Clone)]
pub struct ColumnWriter {
    samples: BTreeMap<Timestamp, Sample>,
}

impl ColumnWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scalar(&mut self, field_type: FieldType, ts: Timestamp, value: f64) {
        self.samples
            .entry(ts)
            .and_modify(|existing| {
                if let Sample::Scalar(existing_value) = existing {
                    *existing_value = field_type.merge(*existing_value, value);
                } else {
                    *existing = Sample::Scalar(value);
                }
            })
            .or_insert(Sample::Scalar(value));
    }

    pub fn push_histogram(&mut self, ts: Timestamp, buckets: Vec<(f64, u64)>) {
        // Histogram collisions always take the newest sample: merge policy
        // is "last" for histogram, same as the scalar `Last` field type.
        self.samples.insert(ts, Sample::Histogram(buckets));
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Samples with `start <= ts < end`, in ascending timestamp order, for
    /// the MemoryDatabase read path which serves unflushed points directly
    /// rather than through the column's on-disk encoding.
    pub fn range(&self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, Sample)> {
        self.samples
            .range(start..end)
            .map(|(&ts, sample)| (ts, sample.clone()))
            .collect()
    }

    /// Every sample in ascending timestamp order, for callers that need to
    /// regroup a drained column by some external key (the flush path buckets
    /// samples into time families) rather than reading a contiguous range.
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, &Sample)> {
        self.samples.iter().map(|(&ts, sample)| (ts, sample))
    }

    /// Encodes: `count: u32, first_ts: u64, (ts_delta: uvarint, payload)*`.
    /// `payload` is `value: f64 LE` for scalar fields, or
    /// `bucket_count: u8, (bound: f64 LE, count: u64 LE)*` for histograms.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(self.samples.len() as u32).to_le_bytes());
        let mut prev_ts: Option<Timestamp> = None;
        let first_ts = self.samples.keys().next().copied().unwrap_or(0);
        buf.extend_from_slice(&(first_ts as u64).to_le_bytes());
        for (&ts, sample) in &self.samples {
            let delta = match prev_ts {
                None => 0,
                Some(p) => (ts - p) as u64,
            };
            write_uvarint(buf, delta)?;
            match sample {
                Sample::Scalar(v) => buf.extend_from_slice(&v.to_le_bytes()),
                Sample::Histogram(buckets) => {
                    let count = u8::try_from(buckets.len())
                        .map_err(|_| Error::malformed("histogram has more than 255 buckets"))?;
                    buf.push(count);
                    for (bound, bucket_count) in buckets {
                        buf.extend_from_slice(&bound.to_le_bytes());
                        buf.extend_from_slice(&bucket_count.to_le_bytes());
                    }
                }
            }
            prev_ts = Some(ts);
        }
        Ok(())
    }
}

/// A decoded, read-only column: the ordered `(timestamp, value)` series for
/// one field over one file's time range.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub samples: Vec<(Timestamp, Sample)>,
}

impl Column {
    pub fn read_from(buf: &[u8], field_type: FieldType) -> Result<Self> {
        let mut pos = 0usize;
        let count = read_u32(buf, &mut pos)? as usize;
        let first_ts = read_u64(buf, &mut pos)? as Timestamp;
        let mut samples = Vec::with_capacity(count);
        let mut ts = first_ts;
        for i in 0..count {
            if i > 0 {
                let mut cursor = &buf[pos..];
                let delta = read_uvarint(&mut cursor)?;
                pos = buf.len() - cursor.len();
                ts += delta as Timestamp;
            } else {
                // consume the zero delta written for the first sample.
                let mut cursor = &buf[pos..];
                let _ = read_uvarint(&mut cursor)?;
                pos = buf.len() - cursor.len();
            }
            let sample = if field_type == FieldType::Histogram {
                let bucket_count = *buf
                    .get(pos)
                    .ok_or_else(|| Error::corrupted("<column>", "truncated histogram bucket count"))?;
                pos += 1;
                let mut buckets = Vec::with_capacity(bucket_count as usize);
                for _ in 0..bucket_count {
                    let bound = f64::from_le_bytes(read_n(buf, &mut pos)?);
                    let bucket_count_val = u64::from_le_bytes(read_n(buf, &mut pos)?);
                    buckets.push((bound, bucket_count_val));
                }
                Sample::Histogram(buckets)
            } else {
                Sample::Scalar(f64::from_le_bytes(read_n(buf, &mut pos)?))
            };
            samples.push((ts, sample));
        }
        Ok(Self { samples })
    }

    pub fn scalar_at(&self, ts: Timestamp) -> Option<f64> {
        self.samples
            .iter()
            .find(|(t, _)| *t == ts)
            .and_then(|(_, s)| s.as_scalar())
    }
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes: [u8; 4] = read_n(buf, pos)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes: [u8; 8] = read_n(buf, pos)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_n<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let end = *pos + N;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| Error::corrupted("<column>", "column ran past end of buffer"))?;
    *pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip_merges_collisions() {
        let mut w = ColumnWriter::new();
        w.push_scalar(FieldType::Sum, 1000, 1.0);
        w.push_scalar(FieldType::Sum, 1000, 2.0);
        w.push_scalar(FieldType::Sum, 2000, 5.0);
        let mut buf = Vec::new();
        w.write_to(&mut buf).unwrap();

        let col = Column::read_from(&buf, FieldType::Sum).unwrap();
        assert_eq!(col.scalar_at(1000), Some(3.0));
        assert_eq!(col.scalar_at(2000), Some(5.0));
    }

    #[test]
    fn histogram_roundtrip() {
        let mut w = ColumnWriter::new();
        w.push_histogram(1000, vec![(1.0, 4), (5.0, 2)]);
        let mut buf = Vec::new();
        w.write_to(&mut buf).unwrap();

        let col = Column::read_from(&buf, FieldType::Histogram).unwrap();
        assert_eq!(
            col.samples,
            vec![(1000, Sample::Histogram(vec![(1.0, 4), (5.0, 2)]))]
        );
    }
}
