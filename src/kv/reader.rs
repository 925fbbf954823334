use crate::codec::{u32_le_at, Bitmap};
use crate::error::Result;

use super::footer::Footer;

/// Read-only view over one KV Table file's bytes. Works equally over an
/// owned `Vec<u8>` or a memory-mapped file, since it only ever borrows.
pub struct KvTableReader<'a> {
    bytes: &'a [u8],
    footer: Footer,
    bitmap: Bitmap,
}

impl<'a> KvTableReader<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        let footer = Footer::parse(bytes)?;
        let bitmap_start = footer.position_of_bitmap as usize;
        let bitmap_end = Footer::position_of_footer(bytes.len());
        let mut cursor = &bytes[bitmap_start..bitmap_end];
        let bitmap = Bitmap::read_from(&mut cursor)?;
        Ok(Self {
            bytes,
            footer,
            bitmap,
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.footer.entry_count
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Looks up `key`'s value blob: bitmap membership check, rank-select to
    /// a dense index, offset-table read, then the blob bounded by the next
    /// offset (or the start of the offsets section for the last entry).
    pub fn get(&self, key: u32) -> Result<Option<&'a [u8]>> {
        let Some(rank) = self.bitmap.rank_of(key) else {
            return Ok(None);
        };
        self.get_by_rank(rank).map(Some)
    }

    /// Direct dense-index lookup, used by callers that already resolved a
    /// key to its rank (e.g. while iterating).
    pub fn get_by_rank(&self, rank: u32) -> Result<&'a [u8]> {
        let offsets_base = self.footer.position_of_offsets as usize;
        let offset = u32_le_at(self.bytes, offsets_base + rank as usize * 4)? as usize;
        let next = if rank + 1 < self.footer.entry_count {
            u32_le_at(self.bytes, offsets_base + (rank as usize + 1) * 4)? as usize
        } else {
            self.footer.position_of_offsets as usize
        };
        Ok(&self.bytes[offset..next])
    }

    /// Iterates all (key, value) pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &'a [u8])> + '_ {
        self.bitmap.iter().enumerate().map(move |(rank, key)| {
            let value = self
                .get_by_rank(rank as u32)
                .expect("rank derived from this reader's own bitmap is always in range");
            (key, value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::writer::KvTableWriter;

    #[test]
    fn iterate_is_ascending_key_order() {
        let mut w = KvTableWriter::new();
        w.insert(2, b"b").unwrap();
        w.insert(4, b"d").unwrap();
        w.insert(9, b"i").unwrap();
        let bytes = w.finish().unwrap();

        let reader = KvTableReader::from_bytes(&bytes).unwrap();
        let collected: Vec<_> = reader.iter().collect();
        assert_eq!(collected, vec![(2, &b"b"[..]), (4, &b"d"[..]), (9, &b"i"[..])]);
    }

    #[test]
    fn empty_table_round_trips() {
        let w = KvTableWriter::new();
        let bytes = w.finish().unwrap();
        let reader = KvTableReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.entry_count(), 0);
        assert_eq!(reader.get(0).unwrap(), None);
        assert_eq!(reader.iter().count(), 0);
    }
}
