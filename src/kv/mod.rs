//! The generic append-only, block-indexed KV Table: the substrate every
//! on-disk table family is built on.

mod file;
mod footer;
mod reader;
mod writer;

pub use file::{create_new, delete, open_mmap, publish_atomically, sst_file_name, sst_path};
pub use footer::{Footer, FOOTER_LEN};
pub use reader::KvTableReader;
pub use writer::KvTableWriter;
