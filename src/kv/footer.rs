use crate::codec::{crc32_of, read_u32_le, write_u32_le};
use crate::error::{Error, Result};

/// The 24-byte footer every KV Table file ends with.
///
/// `position_of_offsets` / `position_of_bitmap` are absolute file offsets.
/// Two reserved `u32` fields keep the footer a fixed, versionable size;
/// readers must not assume they are zero in future generations, but this
/// crate always writes zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub position_of_offsets: u32,
    pub position_of_bitmap: u32,
    pub entry_count: u32,
}

pub const FOOTER_LEN: usize = 24;

impl Footer {
    /// Encodes the footer and appends it to `buf`, computing the CRC32 over
    /// `buf[..]` as it stood *before* the footer was appended — i.e. over
    /// the data region plus the fixed position fields.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_u32_le(buf, self.position_of_offsets)?;
        write_u32_le(buf, self.position_of_bitmap)?;
        write_u32_le(buf, self.entry_count)?;
        write_u32_le(buf, 0)?; // reserved
        write_u32_le(buf, 0)?; // reserved
        // The CRC covers everything written so far: the data region plus the
        // footer's own position fields; only the checksum word is excluded.
        let crc = crc32_of(&buf[..]);
        write_u32_le(buf, crc)?;
        Ok(())
    }

    /// Parses the trailing `FOOTER_LEN` bytes of `file_bytes`, verifying the
    /// CRC32 over everything preceding the checksum word.
    pub fn parse(file_bytes: &[u8]) -> Result<Self> {
        if file_bytes.len() < FOOTER_LEN {
            return Err(Error::corrupted(
                "<kv-table>",
                format!(
                    "file is {} bytes, shorter than the {} byte footer",
                    file_bytes.len(),
                    FOOTER_LEN
                ),
            ));
        }
        let footer_start = file_bytes.len() - FOOTER_LEN;
        let footer_bytes = &file_bytes[footer_start..];
        let mut cursor = footer_bytes;
        let position_of_offsets = read_u32_le(&mut cursor)?;
        let position_of_bitmap = read_u32_le(&mut cursor)?;
        let entry_count = read_u32_le(&mut cursor)?;
        let _reserved_a = read_u32_le(&mut cursor)?;
        let _reserved_b = read_u32_le(&mut cursor)?;
        let stored_crc = read_u32_le(&mut cursor)?;

        let covered = &file_bytes[..file_bytes.len() - 4];
        let computed_crc = crc32_of(covered);
        if computed_crc != stored_crc {
            return Err(Error::corrupted(
                "<kv-table>",
                format!(
                    "footer CRC32 mismatch: stored {stored_crc:#x}, computed {computed_crc:#x}"
                ),
            ));
        }

        Ok(Self {
            position_of_offsets,
            position_of_bitmap,
            entry_count,
        })
    }

    pub fn position_of_footer(file_len: usize) -> usize {
        file_len - FOOTER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_and_verifies_crc() {
        let mut buf = b"some data region bytes".to_vec();
        let footer = Footer {
            position_of_offsets: 4,
            position_of_bitmap: 12,
            entry_count: 3,
        };
        footer.write_to(&mut buf).unwrap();
        let parsed = Footer::parse(&buf).unwrap();
        assert_eq!(parsed, footer);
    }

    #[test]
    fn flipping_a_data_byte_is_detected() {
        let mut buf = b"some data region bytes".to_vec();
        let footer = Footer {
            position_of_offsets: 4,
            position_of_bitmap: 12,
            entry_count: 3,
        };
        footer.write_to(&mut buf).unwrap();
        buf[0] ^= 0xff;
        assert!(Footer::parse(&buf).is_err());
    }

    #[test]
    fn too_short_is_corrupted_not_a_panic() {
        let buf = vec![0u8; 4];
        assert!(Footer::parse(&buf).is_err());
    }
}
