//! Single-shard time-series storage engine.
//!
//! This crate implements the write path and on-disk table formats for one
//! shard of a distributed time-series database: an in-memory write buffer
//! (`memdb`), a durable ID allocator (`sequencer`), four immutable on-disk
//! table families (`tables`), and the `engine` that binds them together into
//! a shard's public read/write contract.
//!
//! Everything outside of a single shard — the query planner, cluster
//! coordination, replication, and configuration loading — is an external
//! collaborator and is not implemented here.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod memdb;
pub mod sequencer;
pub mod tables;
pub mod trie;

pub use config::{ShardConfig, ShardConfigBuilder};
pub use error::{Error, Result};

/// A dense, process-local identifier. Metric IDs, tag-key IDs, and series IDs
/// are all `u32`; field IDs are `u16` (see `FieldId`).
pub type MetricId = u32;
pub type TagKeyId = u32;
pub type TagValueId = u32;
pub type SeriesId = u32;
pub type FieldId = u16;

/// Closed enum of supported field (measurement channel) types.
///
/// The numeric discriminant is the on-disk `field_type` byte and must never
/// be reassigned once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Sum = 0,
    Min = 1,
    Max = 2,
    Last = 3,
    Histogram = 4,
}

impl FieldType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Sum),
            1 => Some(Self::Min),
            2 => Some(Self::Max),
            3 => Some(Self::Last),
            4 => Some(Self::Histogram),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Merges two values for the same (series, field, timestamp) collision.
    pub fn merge(self, existing: f64, incoming: f64) -> f64 {
        match self {
            Self::Sum => existing + incoming,
            Self::Min => existing.min(incoming),
            Self::Max => existing.max(incoming),
            Self::Last | Self::Histogram => incoming,
        }
    }
}

/// Millis-since-epoch timestamp, as stored at rest.
pub type Timestamp = i64;
