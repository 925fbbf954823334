//! Typed shard configuration.
//!
//! This only defines and validates the struct a caller builds up and hands
//! to `Engine::open`; parsing it out of a TOML document is an external
//! collaborator's job and is out of scope here.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

const DEFAULT_TIME_FAMILY_WIDTH: Duration = Duration::from_secs(3600);
const DEFAULT_MEMDB_FLUSH_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_MEMDB_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;
const DEFAULT_MAX_DATA_FILE_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Per-shard configuration: data directory, time-family bucket width
/// (resolved to a configurable default of one hour), and the thresholds
/// that drive `MemoryDatabase` flush scheduling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub data_dir: PathBuf,

    /// Width of the coarse time bucket that groups Metric Data files
    /// (glossary "Time family"). Defaults to one hour.
    #[serde(with = "humantime_serde_duration")]
    pub time_family_width: Duration,

    /// Size, in bytes, above which `MemoryDatabase` is frozen and handed
    /// off to the flush worker, and past which writers see
    /// `ResourceExhausted`.
    pub memdb_flush_threshold_bytes: u64,

    /// Maximum time a `MemoryDatabase` generation is allowed to accumulate
    /// points before being flushed, even if under the size threshold.
    #[serde(with = "humantime_serde_duration")]
    pub memdb_flush_interval: Duration,

    /// Size, in bytes, of the writer's internal buffer used to coalesce
    /// writes to a table file.
    pub write_buffer_size: usize,

    /// Maximum size, in bytes, targeted for one Metric Data file before a
    /// flush rolls over to a new generation.
    pub max_data_file_size: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            time_family_width: DEFAULT_TIME_FAMILY_WIDTH,
            memdb_flush_threshold_bytes: DEFAULT_MEMDB_FLUSH_THRESHOLD_BYTES,
            memdb_flush_interval: DEFAULT_MEMDB_FLUSH_INTERVAL,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_data_file_size: DEFAULT_MAX_DATA_FILE_SIZE,
        }
    }
}

impl ShardConfig {
    pub fn builder(data_dir: impl Into<PathBuf>) -> ShardConfigBuilder {
        ShardConfigBuilder {
            data_dir: data_dir.into(),
            ..ShardConfigBuilder::from_defaults()
        }
    }
}

/// Fluent config builder: every knob defaults sensibly, and `build()`
/// validates the combination.
#[derive(Clone, Debug)]
pub struct ShardConfigBuilder {
    pub(crate) data_dir: PathBuf,
    pub(crate) time_family_width: Duration,
    pub(crate) memdb_flush_threshold_bytes: u64,
    pub(crate) memdb_flush_interval: Duration,
    pub(crate) write_buffer_size: usize,
    pub(crate) max_data_file_size: u64,
}

impl ShardConfigBuilder {
    fn from_defaults() -> Self {
        let d = ShardConfig::default();
        Self {
            data_dir: d.data_dir,
            time_family_width: d.time_family_width,
            memdb_flush_threshold_bytes: d.memdb_flush_threshold_bytes,
            memdb_flush_interval: d.memdb_flush_interval,
            write_buffer_size: d.write_buffer_size,
            max_data_file_size: d.max_data_file_size,
        }
    }

    pub fn time_family_width(mut self, width: Duration) -> Self {
        self.time_family_width = width;
        self
    }

    pub fn memdb_flush_threshold_bytes(mut self, bytes: u64) -> Self {
        self.memdb_flush_threshold_bytes = bytes;
        self
    }

    pub fn memdb_flush_interval(mut self, interval: Duration) -> Self {
        self.memdb_flush_interval = interval;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_data_file_size(mut self, bytes: u64) -> Self {
        self.max_data_file_size = bytes;
        self
    }

    pub fn build(self) -> Result<ShardConfig, BuildError> {
        if self.memdb_flush_threshold_bytes == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "memdb_flush_threshold_bytes",
                reason: "cannot be zero".to_string(),
            });
        }
        if self.write_buffer_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "write_buffer_size",
                reason: "cannot be zero".to_string(),
            });
        }
        if self.max_data_file_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_data_file_size",
                reason: "cannot be zero".to_string(),
            });
        }
        if self.time_family_width.is_zero() {
            return Err(BuildError::InvalidParameter {
                param_name: "time_family_width",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(ShardConfig {
            data_dir: self.data_dir,
            time_family_width: self.time_family_width,
            memdb_flush_threshold_bytes: self.memdb_flush_threshold_bytes,
            memdb_flush_interval: self.memdb_flush_interval,
            write_buffer_size: self.write_buffer_size,
            max_data_file_size: self.max_data_file_size,
        })
    }
}

/// Minimal `Duration` serde shim so `ShardConfig` stays `Serialize` +
/// `Deserialize` without pulling in a TOML-loading dependency (out of
/// scope); encodes as whole seconds.
mod humantime_serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_zero_thresholds() {
        let err = ShardConfig::builder("/tmp/shard")
            .memdb_flush_threshold_bytes(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { .. }));
    }

    #[test]
    fn builder_applies_overrides() {
        let cfg = ShardConfig::builder("/tmp/shard")
            .time_family_width(Duration::from_secs(86_400))
            .max_data_file_size(1024)
            .build()
            .unwrap();
        assert_eq!(cfg.time_family_width, Duration::from_secs(86_400));
        assert_eq!(cfg.max_data_file_size, 1024);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/shard"));
    }
}
