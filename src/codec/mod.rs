//! Codec primitives shared by every on-disk table format: unsigned varints,
//! length-prefixed byte strings, fixed little-endian integers, CRC32
//! footers, and a roaring-bitmap wrapper pinned to a stable wire format.

mod bitmap;
mod crc;
mod fixed;
mod varint;

pub use bitmap::Bitmap;
pub use crc::{crc32_of, Crc32Writer};
pub use fixed::{read_u16_le, read_u32_le, u32_le_at, write_u16_le, write_u32_le};
pub use varint::{read_uvarint, uvarint_len, write_uvarint};

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Writes a uvarint-length-prefixed byte string.
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    write_uvarint(w, bytes.len() as u64)?;
    w.write_all(bytes)
        .map_err(|e| Error::io("<buffer>", e))?;
    Ok(())
}

/// Reads a uvarint-length-prefixed byte string.
pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_uvarint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|e| Error::io("<buffer>", e))?;
    Ok(buf)
}

/// Total encoded length, in bytes, of `write_bytes(bytes)`.
pub fn bytes_len(bytes: &[u8]) -> usize {
    uvarint_len(bytes.len() as u64) + bytes.len()
}

/// Reads exactly `io::ErrorKind::UnexpectedEof` safe helper used across table
/// decoders when validating a slice is long enough before indexing into it.
pub fn require_len(buf: &[u8], needed: usize, what: &'static str) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::corrupted(
            "<in-memory>",
            format!("{what}: expected at least {needed} bytes, got {}", buf.len()),
        ));
    }
    Ok(())
}

pub(crate) fn io_err(e: io::Error) -> Error {
    Error::io("<buffer>", e)
}
