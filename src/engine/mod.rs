//! Binds the write buffer, ID sequencer, and on-disk table families into a
//! shard's public read/write contract.

mod current;
mod shard;

pub use current::CurrentState;
pub use shard::{Engine, FlushReport, RawPoint};
