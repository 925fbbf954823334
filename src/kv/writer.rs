use crate::codec::{write_u32_le, Bitmap};
use crate::error::{Error, Result};

use super::footer::Footer;

/// Builds one KV Table file in memory: a stream of variable-sized value
/// blobs in ascending-key insertion order, followed by an offsets array, a
/// presence bitmap, and a footer.
///
/// Every table family uses this as its write-side substrate; callers are
/// responsible for encoding each value's internal structure (the KV Table
/// only guarantees byte-exact blob boundaries and key → blob lookup).
pub struct KvTableWriter {
    buf: Vec<u8>,
    offsets: Vec<u32>,
    bitmap: Bitmap,
    last_key: Option<u32>,
}

impl KvTableWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            offsets: Vec::new(),
            bitmap: Bitmap::new(),
            last_key: None,
        }
    }

    /// Inserts `value` under `key`. Keys must be inserted in strictly
    /// increasing order; violating this fails with `OutOfOrder`.
    pub fn insert(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(Error::OutOfOrder {
                    key: key as u64,
                    last: last as u64,
                });
            }
        }
        let offset = u32::try_from(self.buf.len()).map_err(|_| {
            Error::malformed("KV table exceeded 4GiB, offsets no longer fit in u32")
        })?;
        self.offsets.push(offset);
        self.bitmap.insert(key);
        self.buf.extend_from_slice(value);
        self.last_key = Some(key);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Finalizes the file: appends the offsets array, the bitmap, and the
    /// footer, returning the complete byte image ready to be written to
    /// disk and fsynced.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let position_of_offsets = u32::try_from(self.buf.len())
            .map_err(|_| Error::malformed("KV table too large for u32 offsets"))?;
        for offset in &self.offsets {
            write_u32_le(&mut self.buf, *offset)?;
        }

        let position_of_bitmap = u32::try_from(self.buf.len())
            .map_err(|_| Error::malformed("KV table too large for u32 offsets"))?;
        self.bitmap.write_to(&mut self.buf)?;

        let footer = Footer {
            position_of_offsets,
            position_of_bitmap,
            entry_count: self.offsets.len() as u32,
        };
        footer.write_to(&mut self.buf)?;

        Ok(self.buf)
    }
}

impl Default for KvTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::reader::KvTableReader;

    #[test]
    fn rejects_non_monotone_keys() {
        let mut w = KvTableWriter::new();
        w.insert(5, b"a").unwrap();
        assert!(w.insert(5, b"b").is_err());
        assert!(w.insert(3, b"c").is_err());
    }

    #[test]
    fn round_trips_through_reader() {
        let mut w = KvTableWriter::new();
        w.insert(1, b"one").unwrap();
        w.insert(5, b"five").unwrap();
        w.insert(100, b"one hundred").unwrap();
        let bytes = w.finish().unwrap();

        let reader = KvTableReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.get(1).unwrap(), Some(&b"one"[..]));
        assert_eq!(reader.get(5).unwrap(), Some(&b"five"[..]));
        assert_eq!(reader.get(100).unwrap(), Some(&b"one hundred"[..]));
        assert_eq!(reader.get(2).unwrap(), None);
    }
}
