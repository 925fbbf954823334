//! Generalized interface for opening, reading, and deleting table files.
//!
//! Synchronous by design: this core's concurrency model is parallel
//! threads, not a cooperative async runtime, so file I/O here is plain
//! `std::fs` plus `memmap2` for read-path random access rather than
//! `tokio`/`async-trait`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, Result};

/// A durable, append-only data file opened for writing.
pub trait WritableFile: std::io::Write {
    fn sync_all(&self) -> Result<()>;
}

impl WritableFile for File {
    fn sync_all(&self) -> Result<()> {
        File::sync_all(self).map_err(|e| Error::io("<file>", e))
    }
}

/// Opens a new file for append-only writing, failing if it already exists.
/// Table files are named by generation and are never overwritten.
pub fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::io(path, e))
}

/// Opens an existing file as a read-only memory map, giving the reader
/// random access to offsets/bitmap/footer without buffering the whole file.
pub fn open_mmap(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    // SAFETY: table files are write-once-then-immutable; no other
    // process/thread truncates or mutates a file after its footer is
    // fsynced, so the mapping cannot observe a concurrent modification.
    unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))
}

/// Atomically publishes a newly written file at `final_path` by writing it
/// at `tmp_path` first and renaming it into place. Used for both table
/// generations and the `CURRENT` pointer.
pub fn publish_atomically(tmp_path: &Path, final_path: &Path) -> Result<()> {
    fs::rename(tmp_path, final_path).map_err(|e| Error::io(final_path, e))
}

pub fn delete(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| Error::io(path, e))
}

/// Builds the canonical `{family}-{generation}-{min_id}-{max_id}.sst` file
/// name for one table generation.
pub fn sst_file_name(family: &str, generation: u64, min_id: u32, max_id: u32) -> String {
    format!("{family}-{generation}-{min_id}-{max_id}.sst")
}

pub fn sst_path(dir: &Path, family: &str, generation: u64, min_id: u32, max_id: u32) -> PathBuf {
    dir.join(sst_file_name(family, generation, min_id, max_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn create_new_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sst");
        let mut f = create_new(&path).unwrap();
        f.write_all(b"hello").unwrap();
        f.sync_all().unwrap();
        assert!(create_new(&path).is_err());
    }

    #[test]
    fn mmap_reads_back_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sst");
        let mut f = create_new(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        f.sync_all().unwrap();
        drop(f);

        let mmap = open_mmap(&path).unwrap();
        assert_eq!(&mmap[..], b"hello world");
    }

    #[test]
    fn publish_atomically_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("a.sst.tmp");
        let final_path = dir.path().join("a.sst");
        let mut f = create_new(&tmp).unwrap();
        f.write_all(b"data").unwrap();
        f.sync_all().unwrap();
        drop(f);

        publish_atomically(&tmp, &final_path).unwrap();
        assert!(!tmp.exists());
        assert!(final_path.exists());
    }
}
