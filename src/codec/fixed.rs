use std::io::{Read, Write};

use super::io_err;
use crate::error::Result;

/// Writes `value` as a fixed 4-byte little-endian integer.
pub fn write_u32_le<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes()).map_err(io_err)
}

/// Reads a fixed 4-byte little-endian integer.
pub fn read_u32_le<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

/// Writes `value` as a fixed 2-byte little-endian integer.
pub fn write_u16_le<W: Write>(w: &mut W, value: u16) -> Result<()> {
    w.write_all(&value.to_le_bytes()).map_err(io_err)
}

/// Reads a fixed 2-byte little-endian integer.
pub fn read_u16_le<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u16::from_le_bytes(buf))
}

/// Reads a u32 LE directly out of a byte slice at `offset`, without a cursor.
pub fn u32_le_at(buf: &[u8], offset: usize) -> Result<u32> {
    super::require_len(buf, offset + 4, "u32_le_at")?;
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_u32_and_u16() {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, 0xdead_beef).unwrap();
        write_u16_le(&mut buf, 0xabcd).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_u32_le(&mut cursor).unwrap(), 0xdead_beef);
        assert_eq!(read_u16_le(&mut cursor).unwrap(), 0xabcd);
    }
}
