use std::io::{Read, Write};

use roaring::RoaringBitmap;

use super::io_err;
use crate::error::Result;

/// A serialized set of dense `u32` ids, supporting union, intersection, and
/// rank/select — the presence-bitmap primitive every table family
/// is built on.
///
/// Backed by `roaring::RoaringBitmap`. The wire format is a `u32` byte-length
/// prefix followed by the bitmap's own portable serialization, so the
/// internal roaring container format can evolve without changing the
/// surrounding KV Table framing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap(RoaringBitmap);

impl Bitmap {
    pub fn new() -> Self {
        Self(RoaringBitmap::new())
    }

    pub fn from_iter(ids: impl IntoIterator<Item = u32>) -> Self {
        Self(RoaringBitmap::from_iter(ids))
    }

    pub fn insert(&mut self, id: u32) -> bool {
        self.0.insert(id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter()
    }

    /// Zero-based position of `id` among the present ids, used to turn a
    /// bitmap membership check into a dense array index for an offsets
    /// table. Returns `None` if `id` is absent.
    pub fn rank_of(&self, id: u32) -> Option<u32> {
        if !self.0.contains(id) {
            return None;
        }
        // `rank` counts elements <= id; since id is present, subtract one to
        // get a zero-based index.
        Some(self.0.rank(id) as u32 - 1)
    }

    pub fn union_with(&mut self, other: &Bitmap) {
        self.0 |= &other.0;
    }

    pub fn intersection(&self, other: &Bitmap) -> Bitmap {
        Bitmap(&self.0 & &other.0)
    }

    /// Encodes the length-prefixed wire format.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut buf = Vec::new();
        self.0.serialize_into(&mut buf).map_err(io_err)?;
        super::write_uvarint(w, buf.len() as u64)?;
        w.write_all(&buf).map_err(io_err)
    }

    /// Decodes the length-prefixed wire format.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let len = super::read_uvarint(r)? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).map_err(io_err)?;
        let bitmap = RoaringBitmap::deserialize_from(&buf[..]).map_err(io_err)?;
        Ok(Self(bitmap))
    }

    /// Total encoded length, in bytes, including the length prefix.
    pub fn encoded_len(&self) -> Result<usize> {
        let mut buf = Vec::new();
        self.0.serialize_into(&mut buf).map_err(io_err)?;
        Ok(super::uvarint_len(buf.len() as u64) + buf.len())
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(RoaringBitmap::from_iter(iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let bitmap: Bitmap = [1u32, 5, 9999, 1_000_000].into_iter().collect();
        let mut buf = Vec::new();
        bitmap.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), bitmap.encoded_len().unwrap());

        let mut cursor = &buf[..];
        let decoded = Bitmap::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, bitmap);
        assert!(cursor.is_empty());
    }

    #[test]
    fn rank_is_dense_zero_based_index() {
        let bitmap: Bitmap = [10u32, 20, 30].into_iter().collect();
        assert_eq!(bitmap.rank_of(10), Some(0));
        assert_eq!(bitmap.rank_of(20), Some(1));
        assert_eq!(bitmap.rank_of(30), Some(2));
        assert_eq!(bitmap.rank_of(15), None);
    }

    proptest::proptest! {
        #[test]
        fn roundtrips_any_set(ids: std::collections::BTreeSet<u32>) {
            let bitmap: Bitmap = ids.iter().copied().collect();
            let mut buf = Vec::new();
            bitmap.write_to(&mut buf).unwrap();
            let mut cursor = &buf[..];
            let decoded = Bitmap::read_from(&mut cursor).unwrap();
            proptest::prop_assert_eq!(decoded, bitmap);
        }
    }
}
