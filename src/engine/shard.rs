//! The Shard: binds one `MemoryDatabase`, one `Sequencer`, and readers/
//! writers for D–G into the eight-operation contract external callers see.
//!
//! `open` performs init (create family directories, load `CURRENT`, replay
//! D/E/F/G to rehydrate identity state); `close` drains the flush queue and
//! joins the worker threads. A dedicated flush-worker thread owns all disk
//! writes; ingestion and query callers never block on file I/O themselves
//! except to wait for an explicit `flush()` call.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::codec::Bitmap;
use crate::config::ShardConfig;
use crate::engine::current::CurrentState;
use crate::error::{Error, Result};
use crate::kv::{create_new, open_mmap, publish_atomically, sst_path};
use crate::memdb::metric_store::TagVector;
use crate::memdb::MemoryDatabase;
use crate::sequencer::Sequencer;
use crate::tables::data::{DataTableReader, DataTableWriter, MetricBlockBuilder};
use crate::tables::meta::{FieldMeta, MetaTableReader, MetaTableWriter, TagKeyMeta};
use crate::tables::nameid::{NameIdTableReader, NameIdTableWriter};
use crate::tables::tagkv::{tag_values_of, TagKvTableReader, TagKvTableWriter};
use crate::tables::{ColumnWriter, Sample};
use crate::{FieldId, FieldType, MetricId, SeriesId, TagKeyId, TagValueId, Timestamp};

/// One ingested point, as handed to `Engine::write_batch`.
#[derive(Debug, Clone)]
pub struct RawPoint {
    pub metric: String,
    pub tags: Vec<(String, String)>,
    pub field: String,
    pub field_type: FieldType,
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Summary of one flush, returned by `Engine::flush`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushReport {
    pub generation: u64,
    pub metrics: usize,
    pub series: usize,
    pub points: u64,
}

/// The four family directories plus `CURRENT`, rooted at one shard's data
/// directory.
struct Dirs {
    root: PathBuf,
    metric_nameid: PathBuf,
    metric_meta: PathBuf,
    tag_kv: PathBuf,
    data: PathBuf,
    current: PathBuf,
}

impl Dirs {
    fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.to_path_buf(),
            metric_nameid: data_dir.join("metric_nameid"),
            metric_meta: data_dir.join("metric_meta"),
            tag_kv: data_dir.join("tag_kv"),
            data: data_dir.join("data"),
            current: data_dir.join("CURRENT"),
        }
    }

    fn create_all(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.metric_nameid,
            &self.metric_meta,
            &self.tag_kv,
            &self.data,
        ] {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir.as_path(), e))?;
        }
        Ok(())
    }

    fn data_family(&self, family: i64) -> PathBuf {
        self.data.join(family.to_string())
    }
}

enum FlushRequest {
    Flush(Sender<Result<FlushReport>>),
}

struct Inner {
    config: ShardConfig,
    sequencer: Sequencer,
    memdb: MemoryDatabase,
    current: Mutex<CurrentState>,
    dirs: Dirs,
}

/// A shard's public handle: write, flush, and serve reads against one data
/// directory.
pub struct Engine {
    inner: Arc<Inner>,
    flush_tx: Option<Sender<FlushRequest>>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Opens a shard: creates the family directories if missing, loads
    /// `CURRENT`, and replays every live generation of D, E, F, and G to
    /// rehydrate the Sequencer and the in-memory tag-value/series identity
    /// state before accepting writes.
    pub fn open(config: ShardConfig) -> Result<Self> {
        let dirs = Dirs::new(&config.data_dir);
        dirs.create_all()?;

        let current = CurrentState::load(&dirs.current)?;
        let sequencer = Sequencer::new();
        let memdb = MemoryDatabase::new(config.memdb_flush_threshold_bytes);

        {
            let _span = info_span!("recovery", data_dir = %dirs.root.display()).entered();
            recover(&sequencer, &memdb, &dirs, &current)?;
        }

        let inner = Arc::new(Inner {
            config,
            sequencer,
            memdb,
            current: Mutex::new(current),
            dirs,
        });

        let (flush_tx, flush_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let worker = spawn_flush_worker(Arc::clone(&inner), flush_rx);
        let ticker = spawn_ticker(flush_tx.clone(), inner.config.memdb_flush_interval, stop_rx);

        Ok(Self {
            inner,
            flush_tx: Some(flush_tx),
            stop_tx: Some(stop_tx),
            worker: Some(worker),
            ticker: Some(ticker),
        })
    }

    /// Accepts a batch of points, resolving each one's ids and writing it
    /// into the MemoryDatabase. Returns one `Result` per input point so a
    /// caller can tell which points in a partially-bad batch succeeded.
    pub fn write_batch(&self, points: Vec<RawPoint>) -> Vec<Result<()>> {
        points.into_iter().map(|p| self.write_one(p)).collect()
    }

    fn write_one(&self, point: RawPoint) -> Result<()> {
        let metric_id = self.inner.sequencer.get_or_create_metric_id(&point.metric);
        let mut tags: Vec<(TagKeyId, &str)> = Vec::with_capacity(point.tags.len());
        for (key, value) in &point.tags {
            let tag_key_id = self
                .inner
                .sequencer
                .get_or_create_tag_key_id(metric_id, key)?;
            tags.push((tag_key_id, value.as_str()));
        }
        let field_id = self
            .inner
            .sequencer
            .get_or_create_field_id(metric_id, &point.field, point.field_type)?;
        let series_id = self.inner.memdb.resolve_series(metric_id, tags);
        self.inner.memdb.write(
            metric_id,
            series_id,
            field_id,
            point.field_type,
            point.timestamp,
            point.value,
        )?;

        if self.inner.memdb.bytes_used() >= self.inner.memdb.byte_budget() {
            self.trigger_async_flush();
        }
        Ok(())
    }

    fn trigger_async_flush(&self) {
        if let Some(tx) = &self.flush_tx {
            let (reply_tx, _reply_rx) = crossbeam_channel::bounded(1);
            let _ = tx.send(FlushRequest::Flush(reply_tx));
        }
    }

    /// Blocks until one full flush (D/E/F snapshot rewrite plus incremental
    /// per-time-family G writes) completes on the flush worker thread.
    pub fn flush(&self) -> Result<FlushReport> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let tx = self.flush_tx.as_ref().ok_or_else(|| Error::Unavailable {
            reason: "shard is closed".to_string(),
        })?;
        tx.send(FlushRequest::Flush(reply_tx))
            .map_err(|_| Error::Unavailable {
                reason: "flush worker is not running".to_string(),
            })?;
        reply_rx.recv().map_err(|_| Error::Unavailable {
            reason: "flush worker dropped its reply channel".to_string(),
        })?
    }

    pub fn lookup_metric(&self, name: &str) -> Option<MetricId> {
        self.inner.sequencer.lookup_metric_id(name)
    }

    /// Metric names starting with `prefix`, in ascending lexicographic
    /// order, capped at `limit`.
    pub fn suggest_metrics(&self, prefix: &str, limit: usize) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .sequencer
            .all_metrics()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name.starts_with(prefix))
            .collect();
        names.sort();
        names.truncate(limit);
        names
    }

    pub fn suggest_tag_keys(&self, metric_id: MetricId) -> Result<Vec<String>> {
        Ok(self
            .inner
            .sequencer
            .tag_keys_of(metric_id)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Every tag value ever seen for `(metric_id, tag_key)`, served entirely
    /// from the live in-memory trie mirror — no disk access at query time,
    /// since F's mirror is kept current by both writes and recovery.
    pub fn suggest_tag_values(&self, metric_id: MetricId, tag_key: &str) -> Result<Vec<String>> {
        let tag_key_id = self
            .inner
            .sequencer
            .tag_keys_of(metric_id)?
            .into_iter()
            .find(|(name, _)| name == tag_key)
            .map(|(_, id)| id);
        let Some(tag_key_id) = tag_key_id else {
            return Ok(Vec::new());
        };
        let metric_store = self.inner.memdb.metric_store(metric_id);
        let values = metric_store
            .tag_index_snapshot()
            .into_iter()
            .find(|(id, ..)| *id == tag_key_id)
            .map(|(_, trie, ..)| {
                trie.sorted_entries()
                    .map(|(value, _)| value.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(values)
    }

    /// Materializes one series' column over `range`, merging the unflushed
    /// MemoryDatabase buffer with every on-disk Metric Data generation that
    /// overlaps the requested range. A later generation shadows an earlier
    /// one for the same timestamp; the unflushed buffer is freshest of all.
    pub fn load(
        &self,
        metric: &str,
        tags: Vec<(&str, &str)>,
        field: &str,
        range: (Timestamp, Timestamp),
    ) -> Result<Vec<(Timestamp, Sample)>> {
        let Some(metric_id) = self.inner.sequencer.lookup_metric_id(metric) else {
            return Ok(Vec::new());
        };
        let known_tag_keys = self.inner.sequencer.tag_keys_of(metric_id)?;
        let mut tag_ids = Vec::with_capacity(tags.len());
        for (name, value) in &tags {
            let Some((_, tag_key_id)) = known_tag_keys.iter().find(|(n, _)| n.as_str() == *name)
            else {
                return Ok(Vec::new());
            };
            tag_ids.push((*tag_key_id, *value));
        }
        let Some((field_id, _field_type)) = self.inner.sequencer.lookup_field(metric_id, field)
        else {
            return Ok(Vec::new());
        };
        let Some(series_id) = self.inner.memdb.lookup_series(metric_id, tag_ids) else {
            return Ok(Vec::new());
        };

        let mut merged: BTreeMap<Timestamp, Sample> = BTreeMap::new();

        let width_ms = self.inner.config.time_family_width.as_millis() as i64;
        let first_family = family_key(range.0, width_ms);
        let last_family = family_key(range.1.saturating_sub(1), width_ms);
        let data_generations = self.inner.current.lock().data.clone();
        for family in first_family..=last_family {
            let Some(gens) = data_generations.get(&family) else {
                continue;
            };
            for &gen in gens {
                let dir = self.inner.dirs.data_family(family);
                let Some(path) = find_generation_file(&dir, "data", gen)? else {
                    continue;
                };
                let mmap = open_mmap(&path)?;
                let reader = DataTableReader::from_bytes(&mmap)?;
                let Some(block) = reader.get_metric(metric_id)? else {
                    continue;
                };
                let Some(column) = block.lookup(series_id, field_id)? else {
                    continue;
                };
                for (ts, sample) in column.samples {
                    if ts >= range.0 && ts < range.1 {
                        merged.insert(ts, sample);
                    }
                }
            }
        }

        for (ts, sample) in self
            .inner
            .memdb
            .query(metric_id, series_id, field_id, range)
        {
            merged.insert(ts, sample);
        }

        Ok(merged.into_iter().collect())
    }

    /// Stops accepting new flush requests, joins the periodic-flush ticker
    /// and the flush worker, and releases the shard's file handles.
    pub fn close(mut self) -> Result<()> {
        let _span = info_span!("close", data_dir = %self.inner.dirs.root.display()).entered();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        // Dropping this engine's own sender, after the ticker thread has
        // already dropped its clone, leaves zero senders on the channel so
        // the worker's `recv()` returns Err and its loop exits.
        self.flush_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

fn spawn_flush_worker(inner: Arc<Inner>, rx: Receiver<FlushRequest>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("shard-flush".to_string())
        .spawn(move || {
            while let Ok(FlushRequest::Flush(reply)) = rx.recv() {
                let result = inner.flush_once();
                let _ = reply.send(result);
            }
        })
        .expect("failed to spawn flush worker thread")
}

fn spawn_ticker(
    flush_tx: Sender<FlushRequest>,
    interval: Duration,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("shard-flush-ticker".to_string())
        .spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
                    if flush_tx.send(FlushRequest::Flush(reply_tx)).is_err() {
                        break;
                    }
                    if let Ok(Err(e)) = reply_rx.recv() {
                        warn!(error = %e, "periodic flush failed");
                    }
                }
            }
        })
        .expect("failed to spawn flush ticker thread")
}

impl Inner {
    /// Freezes the MemoryDatabase and writes out one generation: full
    /// snapshot rewrites of D/E/F, plus incremental per-time-family writes
    /// of G covering only the points newly drained by this freeze.
    fn flush_once(&self) -> Result<FlushReport> {
        let _span = info_span!("flush").entered();
        let frozen = self.memdb.freeze();
        let generation = frozen.generation;

        let all_metrics = self.sequencer.all_metrics();
        let mut nameid_writer = NameIdTableWriter::new();
        for (name, id) in &all_metrics {
            nameid_writer.push(name.clone(), *id);
        }
        let next_metric_id = self.sequencer.next_metric_id_high_water_mark();
        let nameid_bytes = nameid_writer.finish(next_metric_id, 0)?;
        write_generation(
            &self.dirs.metric_nameid,
            "metric_nameid",
            generation,
            0,
            0,
            &nameid_bytes,
        )?;

        let ids: Vec<MetricId> = all_metrics.iter().map(|(_, id)| *id).collect();
        let (meta_min, meta_max) = min_max(&ids);
        let mut meta_writer = MetaTableWriter::new();
        for &metric_id in &ids {
            let tag_keys = self
                .sequencer
                .tag_keys_of(metric_id)?
                .into_iter()
                .map(|(name, tag_key_id)| TagKeyMeta { name, tag_key_id })
                .collect();
            let fields = self
                .sequencer
                .fields_of(metric_id)?
                .into_iter()
                .map(|(name, field_id, field_type)| FieldMeta {
                    name,
                    field_type,
                    field_id,
                })
                .collect();
            meta_writer.push(metric_id, tag_keys, fields);
        }
        let meta_bytes = meta_writer.finish()?;
        write_generation(
            &self.dirs.metric_meta,
            "metric_meta",
            generation,
            meta_min,
            meta_max,
            &meta_bytes,
        )?;

        for (metric_id, metric_store) in self.memdb.all_metrics() {
            let mut writer = TagKvTableWriter::new();
            for (tag_key_id, trie, bitmaps, union) in metric_store.tag_index_snapshot() {
                writer.push(tag_key_id, trie, bitmaps, union);
            }
            let bytes = writer.finish()?;
            write_generation(
                &self.dirs.tag_kv,
                "tag_kv",
                generation,
                metric_id,
                metric_id,
                &bytes,
            )?;
        }

        let width_ms = self.config.time_family_width.as_millis() as i64;
        let mut by_family: BTreeMap<i64, BTreeMap<MetricId, MetricBlockBuilder>> = BTreeMap::new();
        let mut series_touched = 0usize;
        let mut points_touched = 0u64;

        for (metric_id, _metric_store, drained_series) in frozen.metrics() {
            let fields_meta: Vec<(FieldId, FieldType)> = self
                .sequencer
                .fields_of(*metric_id)?
                .into_iter()
                .map(|(_, field_id, field_type)| (field_id, field_type))
                .collect();
            for (series_id, fields) in drained_series {
                series_touched += 1;
                for (field_id, (field_type, column)) in fields {
                    points_touched += column.len() as u64;
                    for (family, bucket) in bucket_column(column, width_ms, *field_type) {
                        let time_range = (family * width_ms, (family + 1) * width_ms);
                        let block = by_family
                            .entry(family)
                            .or_default()
                            .entry(*metric_id)
                            .or_insert_with(|| {
                                MetricBlockBuilder::new(*metric_id, time_range, fields_meta.clone())
                            });
                        block.series_mut(*series_id).insert(*field_id, bucket);
                    }
                }
            }
        }

        let mut current = self.current.lock();
        for (family, metrics) in by_family {
            let family_ids: Vec<MetricId> = metrics.keys().copied().collect();
            let (min_id, max_id) = min_max(&family_ids);
            let mut writer = DataTableWriter::new();
            for (_, block) in metrics {
                writer.push(block);
            }
            let bytes = writer.finish()?;
            let dir = self.dirs.data_family(family);
            fs::create_dir_all(&dir).map_err(|e| Error::io(dir.as_path(), e))?;
            write_generation(&dir, "data", generation, min_id, max_id, &bytes)?;
            current.add_data_generation(family, generation);
        }

        current.metric_nameid = Some(generation);
        current.metric_meta = Some(generation);
        current.tag_kv = Some(generation);
        current.publish(&self.dirs.current)?;
        drop(current);

        info!(
            generation,
            metrics = frozen.metrics().len(),
            series = series_touched,
            points = points_touched,
            "flush complete"
        );

        Ok(FlushReport {
            generation,
            metrics: frozen.metrics().len(),
            series: series_touched,
            points: points_touched,
        })
    }
}

/// Replays D, then E, then F and G in order, rehydrating the Sequencer's
/// name/tag-key/field identity and the MemoryDatabase's tag-value tries and
/// series identity — everything a restart must not be allowed to forget or
/// reallocate under a new id.
fn recover(
    sequencer: &Sequencer,
    memdb: &MemoryDatabase,
    dirs: &Dirs,
    current: &CurrentState,
) -> Result<()> {
    if let Some(gen) = current.metric_nameid {
        let path = sst_path(&dirs.metric_nameid, "metric_nameid", gen, 0, 0);
        let mmap = open_mmap(&path)?;
        let reader = NameIdTableReader::from_bytes(&mmap)?;
        for record in reader.records() {
            sequencer.restore_metric(&record.name, record.metric_id);
        }
        sequencer.reseed_next_metric_id(reader.next_metric_id);
        info!(
            generation = gen,
            metrics = reader.records().len(),
            "replayed metric-nameid index"
        );
    }

    let metric_ids: Vec<MetricId> = sequencer
        .all_metrics()
        .into_iter()
        .map(|(_, id)| id)
        .collect();

    if let Some(gen) = current.metric_meta {
        let (min_id, max_id) = min_max(&metric_ids);
        let path = sst_path(&dirs.metric_meta, "metric_meta", gen, min_id, max_id);
        let mmap = open_mmap(&path)?;
        let reader = MetaTableReader::from_bytes(&mmap)?;
        for (metric_id, entry) in reader.iter() {
            let entry = entry?;
            for tk in entry.tag_keys()? {
                sequencer.restore_tag_key(metric_id, &tk.name, tk.tag_key_id)?;
            }
            for f in entry.fields()? {
                sequencer.restore_field(metric_id, &f.name, f.field_id, f.field_type)?;
            }
        }
        info!(generation = gen, "replayed metric-meta index");
    }

    // Every series any metric has ever held, as the union of its Series
    // Bitmaps across every live Metric Data generation. Computed up front
    // (rather than per tag-kv file below) since it requires scanning every
    // time family once, not once per metric.
    let mut series_by_metric: BTreeMap<MetricId, Bitmap> = BTreeMap::new();
    for (&family, gens) in &current.data {
        for &gen in gens {
            let dir = dirs.data_family(family);
            let Some(path) = find_generation_file(&dir, "data", gen)? else {
                continue;
            };
            let mmap = open_mmap(&path)?;
            let reader = DataTableReader::from_bytes(&mmap)?;
            for &metric_id in &metric_ids {
                if let Some(block) = reader.get_metric(metric_id)? {
                    series_by_metric
                        .entry(metric_id)
                        .or_default()
                        .union_with(&block.series_bitmap()?);
                }
            }
        }
    }

    if let Some(gen) = current.tag_kv {
        for &metric_id in &metric_ids {
            let path = sst_path(&dirs.tag_kv, "tag_kv", gen, metric_id, metric_id);
            if !path.exists() {
                continue;
            }
            let mmap = open_mmap(&path)?;
            let reader = TagKvTableReader::from_bytes(&mmap)?;
            let tag_keys = sequencer.tag_keys_of(metric_id)?;
            let metric_store = memdb.metric_store(metric_id);

            let mut entries_by_key = Vec::with_capacity(tag_keys.len());
            for &(_, tag_key_id) in &tag_keys {
                if let Some(entry) = reader.get(tag_key_id)? {
                    let trie = entry.trie()?;
                    let restored: Vec<(String, TagValueId)> =
                        trie.iter().map(|(v, id)| (v.to_string(), id)).collect();
                    metric_store.restore_tag_trie(
                        tag_key_id,
                        restored,
                        entry.next_tag_value_sequence,
                        |id| entry.series_for_value(id),
                    )?;
                    entries_by_key.push((tag_key_id, entry));
                }
            }

            if let Some(series) = series_by_metric.get(&metric_id) {
                for series_id in series.iter() {
                    let mut tag_vector: TagVector = Vec::new();
                    for (tag_key_id, entry) in &entries_by_key {
                        if let Some(&value) = tag_values_of(entry, series_id)?.first() {
                            tag_vector.push((*tag_key_id, value));
                        }
                    }
                    tag_vector.sort_by_key(|(id, _)| *id);
                    metric_store.restore_series(series_id, tag_vector);
                }
            }
        }
        info!(
            generation = gen,
            "replayed tag-kv index and series identity"
        );
    }

    Ok(())
}

fn min_max(ids: &[MetricId]) -> (MetricId, MetricId) {
    match (ids.iter().min(), ids.iter().max()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => (0, 0),
    }
}

fn family_key(ts: Timestamp, width_ms: i64) -> i64 {
    ts.div_euclid(width_ms)
}

fn bucket_column(
    column: &ColumnWriter,
    width_ms: i64,
    field_type: FieldType,
) -> BTreeMap<i64, ColumnWriter> {
    let mut out: BTreeMap<i64, ColumnWriter> = BTreeMap::new();
    for (ts, sample) in column.iter() {
        let bucket = out.entry(family_key(ts, width_ms)).or_default();
        match sample {
            Sample::Scalar(v) => bucket.push_scalar(field_type, ts, *v),
            Sample::Histogram(buckets) => bucket.push_histogram(ts, buckets.clone()),
        }
    }
    out
}

/// Scans `dir` for a file whose name starts with `"{family}-{generation}-"`,
/// used for the one table family (Metric Data) whose filename is not
/// deterministically computable from already-recovered state.
fn find_generation_file(dir: &Path, family: &str, generation: u64) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let prefix = format!("{family}-{generation}-");
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn write_generation(
    dir: &Path,
    family: &str,
    generation: u64,
    min_id: u32,
    max_id: u32,
    bytes: &[u8],
) -> Result<()> {
    use std::io::Write as _;
    let final_path = sst_path(dir, family, generation, min_id, max_id);
    let tmp_path = final_path.with_extension("tmp");
    let mut file = create_new(&tmp_path)?;
    file.write_all(bytes).map_err(|e| Error::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
    drop(file);
    publish_atomically(&tmp_path, &final_path)
}
