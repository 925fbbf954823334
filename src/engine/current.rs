//! The `CURRENT` file: the one mutable pointer in an otherwise append-only
//! shard directory, naming the live generations of each table family.
//!
//! Format is deliberately grep-able plain text, one fact per line:
//!
//! ```text
//! metric_nameid 4
//! metric_meta 4
//! tag_kv 4
//! data 409024 3
//! data 409024 5
//! data 409025 4
//! ```
//!
//! The Metric-NameID, Metric-Meta, and Tag KV Index families are rewritten
//! as a complete snapshot on every flush (diffs are not supported for them),
//! so they carry exactly one live generation. Metric Data is append-only per
//! time family: each flush only writes the points newly drained from the
//! write buffer, so a family can have several live generations at once,
//! which the read path merges at query time. Compacting old generations
//! together is not implemented here.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use crate::kv::{create_new, delete, publish_atomically};

#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    pub metric_nameid: Option<u64>,
    pub metric_meta: Option<u64>,
    pub tag_kv: Option<u64>,
    pub data: BTreeMap<i64, Vec<u64>>,
}

impl CurrentState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut state = Self::default();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["metric_nameid", gen] => state.metric_nameid = Some(parse_gen(gen, path)?),
                ["metric_meta", gen] => state.metric_meta = Some(parse_gen(gen, path)?),
                ["tag_kv", gen] => state.tag_kv = Some(parse_gen(gen, path)?),
                ["data", family, gen] => {
                    let family: i64 = family
                        .parse()
                        .map_err(|_| Error::corrupted(path, "malformed time family key"))?;
                    state.data.entry(family).or_default().push(parse_gen(gen, path)?);
                }
                [] => {}
                _ => return Err(Error::corrupted(path, format!("malformed CURRENT line: {line:?}"))),
            }
        }
        Ok(state)
    }

    /// Adds a newly-flushed generation for one time family, without
    /// disturbing any generation already recorded for it.
    pub fn add_data_generation(&mut self, family: i64, generation: u64) {
        self.data.entry(family).or_default().push(generation);
    }

    /// Writes this state atomically: a fresh temp file, fsynced, then
    /// renamed over the previous `CURRENT` (same publish discipline as a
    /// table generation).
    pub fn publish(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        if tmp.exists() {
            delete(&tmp)?;
        }
        let mut file = create_new(&tmp)?;
        if let Some(gen) = self.metric_nameid {
            writeln!(file, "metric_nameid {gen}").map_err(|e| Error::io(&tmp, e))?;
        }
        if let Some(gen) = self.metric_meta {
            writeln!(file, "metric_meta {gen}").map_err(|e| Error::io(&tmp, e))?;
        }
        if let Some(gen) = self.tag_kv {
            writeln!(file, "tag_kv {gen}").map_err(|e| Error::io(&tmp, e))?;
        }
        for (family, gens) in &self.data {
            for gen in gens {
                writeln!(file, "data {family} {gen}").map_err(|e| Error::io(&tmp, e))?;
            }
        }
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;
        drop(file);
        publish_atomically(&tmp, path)
    }
}

fn parse_gen(s: &str, path: &Path) -> Result<u64> {
    s.parse()
        .map_err(|_| Error::corrupted(path, "malformed generation number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = CurrentState::load(&dir.path().join("CURRENT")).unwrap();
        assert!(state.metric_nameid.is_none());
        assert!(state.data.is_empty());
    }

    #[test]
    fn publish_then_load_round_trips_multiple_generations_per_family() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CURRENT");
        let mut state = CurrentState {
            metric_nameid: Some(3),
            metric_meta: Some(3),
            tag_kv: Some(3),
            data: BTreeMap::new(),
        };
        state.add_data_generation(100, 1);
        state.add_data_generation(100, 3);
        state.add_data_generation(101, 2);
        state.publish(&path).unwrap();

        let loaded = CurrentState::load(&path).unwrap();
        assert_eq!(loaded.metric_nameid, Some(3));
        assert_eq!(loaded.data.get(&100), Some(&vec![1, 3]));
        assert_eq!(loaded.data.get(&101), Some(&vec![2]));
    }
}
