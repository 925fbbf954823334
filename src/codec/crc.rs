use std::io::{self, Write};

use crc32fast::Hasher;

/// Computes the IEEE CRC32 of `bytes`, used for every footer's checksum
/// field. Each format section states the exact byte range it covers.
pub fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// A `Write` adapter that feeds every byte written through it into a running
/// CRC32 hasher, so a writer can compute a footer checksum incrementally
/// instead of buffering the whole data region to hash it afterward.
pub struct Crc32Writer<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> Crc32Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Crc32Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_bulk() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let bulk = crc32_of(data);

        let mut buf = Vec::new();
        let mut w = Crc32Writer::new(&mut buf);
        w.write_all(&data[..10]).unwrap();
        w.write_all(&data[10..]).unwrap();
        assert_eq!(w.finalize(), bulk);
    }

    #[test]
    fn flipping_a_byte_changes_the_checksum() {
        let mut data = b"stable footer payload".to_vec();
        let original = crc32_of(&data);
        data[3] ^= 0xff;
        assert_ne!(crc32_of(&data), original);
    }
}
