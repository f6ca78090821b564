//! Database handle.
//!
//! Semantics:
//! - Internal keys are ordered by `(user_key ASC, seqno DESC, kind)`.
//! - Reads run at the newest visible sequence number (or an explicit
//!   snapshot) and merge the flushable queue, newest first, with the
//!   current version's levels.
//! - Deletes are tombstones; range deletes are spans.
//! - WAL + manifest follow a strict fsync/rename discipline.
//!
//! Ingestion of externally built tables is the flagship write path; see the
//! `ingest` module.

mod options;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::commit::{CommitPipeline, SeqNumAssignment};
use crate::compaction::{CompactionInfo, CompactionOptions, CompactionPicker, LevelMetrics};
use crate::error::IngestError;
use crate::event::EventListener;
use crate::iterator::ReaderProvider;
use crate::memtable::{Flushable, FlushableEntry, MemTable};
use crate::version::{FileMetadata, VersionEdit, VersionSet, NUM_LEVELS};
use crate::wal::{Wal, WalRecord};

pub use options::{DbOptions, FormatMajorVersion, ReadOptions};

pub type Value = Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Set,
    Delete,
    /// Range deletion tombstone over `[key, value)`.
    RangeDelete,
    /// Range key set over `[key, value)`.
    RangeKeySet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: Bytes,
    pub value: Bytes,
}

impl Op {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::Delete,
            key: key.into(),
            value: Bytes::new(),
        }
    }

    /// Delete all keys in `[start, end)`.
    pub fn delete_range(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::RangeDelete,
            key: start.into(),
            value: end.into(),
        }
    }

    /// Set a range key over `[start, end)`.
    pub fn range_key_set(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            kind: OpKind::RangeKeySet,
            key: start.into(),
            value: end.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DbMetrics {
    pub visible_seqno: u64,
    pub flushable_queue_len: usize,
    pub levels: BTreeMap<usize, LevelMetrics>,
}

pub(crate) struct ValidationState {
    pub(crate) pending: Vec<(usize, Arc<FileMetadata>)>,
    pub(crate) validating: bool,
}

pub(crate) struct DbState {
    /// Flushable queue, oldest to newest; the last entry wraps the mutable
    /// memtable.
    pub(crate) queue: Vec<Arc<FlushableEntry>>,
    pub(crate) mutable: Arc<MemTable>,
    pub(crate) next_job_id: u64,
    pub(crate) compactions: Vec<(u64, CompactionInfo)>,
    next_compaction_id: u64,
    pub(crate) validation: ValidationState,
}

pub(crate) struct DbInner {
    pub(crate) dir: PathBuf,
    pub(crate) options: DbOptions,
    pub(crate) listener: Arc<dyn EventListener>,
    pub(crate) wal: Wal,
    pub(crate) commit: CommitPipeline,
    pub(crate) versions: Arc<VersionSet>,
    pub(crate) state: Mutex<DbState>,
    pub(crate) flush_cv: Condvar,
    pub(crate) closed: AtomicBool,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

/// Database handle. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create dir {dir:?}"))?;

        let versions = Arc::new(
            VersionSet::recover(&dir, options.reader_cache_entries).context("recover versions")?,
        );

        let mut max_seqno = versions.last_seqno_hint();
        let mut queue: Vec<Arc<FlushableEntry>> = Vec::new();
        if !options.disable_wal {
            let segments = Wal::replay(&dir, versions.min_unflushed_log_num())
                .context("replay wal")?;
            for (log_num, records) in segments {
                let mut mem: Option<Arc<MemTable>> = None;
                for record in records {
                    max_seqno = max_seqno.max(record.last_seqno());
                    match record {
                        WalRecord::Batch { seqno, ops } => {
                            mem.get_or_insert_with(|| Arc::new(MemTable::new()))
                                .apply(seqno, &ops);
                        }
                        WalRecord::IngestedTables { seqno, file_nums } => {
                            match crate::ingest::rebuild_ingested_flushable(
                                &versions,
                                options.format_major_version,
                                seqno,
                                &file_nums,
                            ) {
                                Ok(flushable) => {
                                    let entry = FlushableEntry::new(
                                        Flushable::Ingested(Arc::new(flushable)),
                                        log_num,
                                    );
                                    entry.force_flush();
                                    queue.push(entry);
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        log_num,
                                        error = %err,
                                        "dropping unrecoverable ingest record"
                                    );
                                }
                            }
                        }
                    }
                }
                if let Some(mem) = mem {
                    if !mem.is_empty() {
                        let entry = FlushableEntry::new(Flushable::Mem(mem), log_num);
                        entry.force_flush();
                        queue.push(entry);
                    }
                }
            }
        }

        let mutable_log = versions.next_file_num();
        let wal = Wal::open(&dir, mutable_log, options.sync_writes).context("open wal")?;
        let mutable = Arc::new(MemTable::new());
        queue.push(FlushableEntry::new(
            Flushable::Mem(mutable.clone()),
            mutable_log,
        ));

        let mut recovered_files = Vec::new();
        for entry in &queue {
            if let Flushable::Ingested(ing) = &entry.flushable {
                recovered_files.extend(ing.file_nums());
            }
        }
        versions
            .sweep_orphans(&recovered_files)
            .context("sweep orphaned tables")?;

        let listener = options.event_listener.clone();
        let inner = Arc::new(DbInner {
            dir,
            commit: CommitPipeline::new(max_seqno),
            listener,
            wal,
            versions,
            state: Mutex::new(DbState {
                queue,
                mutable,
                next_job_id: 1,
                compactions: Vec::new(),
                next_compaction_id: 1,
                validation: ValidationState {
                    pending: Vec::new(),
                    validating: false,
                },
            }),
            flush_cv: Condvar::new(),
            closed: AtomicBool::new(false),
            flush_worker: Mutex::new(None),
            options,
        });

        let worker_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("graftdb-flush".to_string())
            .spawn(move || flush_loop(worker_inner))?;
        *inner.flush_worker.lock() = Some(handle);
        inner.flush_cv.notify_all();

        Ok(Self { inner })
    }

    /// Stops the background flush worker. Idempotent; any unflushed
    /// memtable state is recovered from the WAL on the next open.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.flush_cv.notify_all();
        if let Some(handle) = self.inner.flush_worker.lock().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn check_open(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            panic!("graftdb: database is closed");
        }
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> anyhow::Result<()> {
        self.write_batch(vec![Op::set(key, value)])
    }

    pub fn delete(&self, key: impl Into<Bytes>) -> anyhow::Result<()> {
        self.write_batch(vec![Op::delete(key)])
    }

    pub fn delete_range(
        &self,
        start: impl Into<Bytes>,
        end: impl Into<Bytes>,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::delete_range(start, end)])
    }

    pub fn range_key_set(
        &self,
        start: impl Into<Bytes>,
        end: impl Into<Bytes>,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::range_key_set(start, end)])
    }

    pub fn write_batch(&self, ops: Vec<Op>) -> anyhow::Result<()> {
        self.check_open();
        if self.inner.options.read_only {
            return Err(IngestError::ReadOnly.into());
        }
        if ops.is_empty() {
            return Ok(());
        }
        let count = ops.len() as u64;
        let mut batch = WriteBatch {
            inner: &self.inner,
            ops,
            err: None,
        };
        self.inner.commit.allocate_seq_num(count, &mut batch);
        match batch.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<Value>> {
        self.get_with_options(key, ReadOptions::default())
    }

    pub fn get_with_options(
        &self,
        key: impl AsRef<[u8]>,
        opts: ReadOptions,
    ) -> anyhow::Result<Option<Value>> {
        self.check_open();
        let key = key.as_ref();
        let snapshot = opts
            .snapshot_seqno
            .unwrap_or_else(|| self.inner.commit.visible_seqno());

        let entries: Vec<Arc<FlushableEntry>> = self.inner.state.lock().queue.clone();
        let mut best: Option<(u64, Option<Value>)> = None;
        for entry in entries.iter().rev() {
            merge_candidate(&mut best, entry.flushable.get(key, snapshot));
        }

        let current = self.inner.versions.current_version();
        for (_, meta) in current.all_files() {
            if !meta.contains_user_key(key) {
                continue;
            }
            let reader = self.inner.versions.reader(meta)?;
            let found = reader
                .get(key, snapshot)
                .with_context(|| format!("read table {}", meta.file_num))?;
            let tombstone = reader
                .range_del_spans()
                .iter()
                .filter(|s| s.contains(key) && s.start.seqno <= snapshot)
                .map(|s| s.start.seqno)
                .max();
            let merged = match (found, tombstone) {
                (Some((seq, value)), Some(tseq)) => {
                    if tseq >= seq {
                        Some((tseq, None))
                    } else {
                        Some((seq, value))
                    }
                }
                (found, None) => found,
                (None, Some(tseq)) => Some((tseq, None)),
            };
            merge_candidate(&mut best, merged);
        }

        Ok(best.and_then(|(_, v)| v))
    }

    /// Rotates the mutable memtable (when non-empty) and blocks until every
    /// queued flushable has been flushed.
    pub fn flush(&self) -> anyhow::Result<()> {
        self.check_open();
        let waiters: Vec<Arc<FlushableEntry>> = {
            let mut state = self.inner.state.lock();
            if !state.mutable.is_empty() {
                self.inner.rotate_memtable_locked(&mut state)?;
            }
            let len = state.queue.len();
            state.queue[..len - 1].to_vec()
        };
        self.inner.flush_cv.notify_all();
        for entry in waiters {
            entry.flushed.wait();
        }
        Ok(())
    }

    /// File numbers installed at `level` in the current version.
    pub fn files_at_level(&self, level: usize) -> Vec<u64> {
        assert!(level < NUM_LEVELS);
        self.inner
            .versions
            .current_version()
            .files(level)
            .iter()
            .map(|f| f.file_num)
            .collect()
    }

    pub fn metrics(&self) -> DbMetrics {
        DbMetrics {
            visible_seqno: self.inner.commit.visible_seqno(),
            flushable_queue_len: self.inner.state.lock().queue.len(),
            levels: self.inner.versions.level_metrics(),
        }
    }

    /// Registers an in-progress compaction's output range; the target-level
    /// picker avoids it. Returns a token for `complete_compaction`.
    pub fn register_compaction(&self, info: CompactionInfo) -> u64 {
        let mut state = self.inner.state.lock();
        let id = state.next_compaction_id;
        state.next_compaction_id += 1;
        state.compactions.push((id, info));
        id
    }

    pub fn complete_compaction(&self, id: u64) {
        self.inner
            .state
            .lock()
            .compactions
            .retain(|(cid, _)| *cid != id);
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Last user handle: the only other strong ref belongs to the flush
        // worker.
        if Arc::strong_count(&self.inner) <= 2 {
            self.close();
        }
    }
}

fn merge_candidate(best: &mut Option<(u64, Option<Value>)>, candidate: Option<(u64, Option<Value>)>) {
    if let Some((seq, value)) = candidate {
        match best {
            Some((best_seq, _)) if *best_seq >= seq => {}
            _ => *best = Some((seq, value)),
        }
    }
}

struct WriteBatch<'a> {
    inner: &'a DbInner,
    ops: Vec<Op>,
    err: Option<anyhow::Error>,
}

impl SeqNumAssignment for WriteBatch<'_> {
    fn prepare(&mut self, seqno: u64) {
        if self.inner.options.disable_wal {
            return;
        }
        if let Err(err) = self.inner.wal.append(&WalRecord::Batch {
            seqno,
            ops: self.ops.clone(),
        }) {
            self.err = Some(err);
        }
    }

    fn apply(&mut self, seqno: u64) {
        if self.err.is_some() {
            return;
        }
        let mutable = self.inner.state.lock().mutable.clone();
        mutable.apply(seqno, &self.ops);

        if mutable.approximate_bytes() > self.inner.options.memtable_bytes {
            let mut state = self.inner.state.lock();
            if Arc::ptr_eq(&state.mutable, &mutable) {
                if let Err(err) = self.inner.rotate_memtable_locked(&mut state) {
                    tracing::warn!(error = %err, "memtable rotation failed");
                } else {
                    drop(state);
                    self.inner.flush_cv.notify_all();
                }
            }
        }
    }
}

impl DbInner {
    pub(crate) fn next_job_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_job_id;
        state.next_job_id += 1;
        id
    }

    /// Replaces the mutable memtable with a fresh one on a new WAL segment.
    /// The old memtable's entry stays in the queue and becomes immutable by
    /// virtue of no longer being last.
    pub(crate) fn rotate_memtable_locked(&self, state: &mut DbState) -> anyhow::Result<()> {
        let new_log = self.versions.next_file_num();
        if !self.options.disable_wal {
            self.wal.rotate(new_log)?;
        }
        let mem = Arc::new(MemTable::new());
        state.queue.push(FlushableEntry::new(
            Flushable::Mem(mem.clone()),
            new_log,
        ));
        state.mutable = mem;
        Ok(())
    }

    pub(crate) fn in_progress_compactions(&self) -> Vec<CompactionInfo> {
        self.state
            .lock()
            .compactions
            .iter()
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub(crate) fn maybe_schedule_compaction(&self) {
        let metrics = self.versions.level_metrics();
        let options = CompactionOptions::default();
        if CompactionPicker::should_compact(&metrics, &options) {
            let candidate = CompactionPicker::pick_highest_score(&metrics, &options);
            tracing::info!(
                level = candidate.as_ref().map(|c| c.level),
                score = candidate.as_ref().map(|c| c.score),
                "compaction needed"
            );
        }
    }

    /// Builds an L0-shaped table from a memtable's contents. Bounds carry
    /// the real per-key sequence numbers.
    fn build_table_from_memtable(
        &self,
        file_num: u64,
        mem: &MemTable,
    ) -> anyhow::Result<Arc<FileMetadata>> {
        let format = self.options.format_major_version.max_table_format();
        let mut builder = crate::sst::TableBuilder::create(
            self.versions.objstore().dir(),
            file_num,
            self.options.block_size,
            format,
        )?;

        let entries = mem.entries();
        let range_dels = mem.range_del_spans();
        let range_keys = mem.range_key_spans();

        let mut smallest_seqno = u64::MAX;
        let mut largest_seqno = 0u64;
        for (key, value) in &entries {
            smallest_seqno = smallest_seqno.min(key.seqno);
            largest_seqno = largest_seqno.max(key.seqno);
            builder.add(key, value)?;
        }
        for span in &range_dels {
            smallest_seqno = smallest_seqno.min(span.start.seqno);
            largest_seqno = largest_seqno.max(span.start.seqno);
            builder.add_range_del(span.clone())?;
        }
        for span in &range_keys {
            smallest_seqno = smallest_seqno.min(span.start.seqno);
            largest_seqno = largest_seqno.max(span.start.seqno);
            builder.add_range_key(span.clone())?;
        }

        let path = builder.path().to_path_buf();
        let props = builder.finish()?;
        let size = std::fs::metadata(&path)
            .with_context(|| format!("stat flushed table {}", path.display()))?
            .len();

        let mut meta = FileMetadata::new(file_num, size);
        meta.set_stats_from_properties(&props);
        if let (Some((first, _)), Some((last, _))) = (entries.first(), entries.last()) {
            meta.extend_point_key_bounds(first.clone(), last.clone());
        }
        if let (Some(first), Some(last)) = (range_dels.first(), range_dels.last()) {
            meta.extend_point_key_bounds(first.start.clone(), last.end_sentinel());
        }
        if let (Some(first), Some(last)) = (range_keys.first(), range_keys.last()) {
            meta.extend_range_key_bounds(first.start.clone(), last.end_sentinel());
        }
        meta.smallest_seqno = smallest_seqno;
        meta.largest_seqno = largest_seqno;
        meta.validate()?;
        Ok(Arc::new(meta))
    }

    /// Places `files` with the target-level picker and publishes one
    /// version edit. `ingested` switches the per-level metrics to ingest
    /// counters.
    pub(crate) fn place_and_publish(
        &self,
        job_id: u64,
        files: &[Arc<FileMetadata>],
        min_unflushed_log_num: Option<u64>,
        ingested: bool,
    ) -> anyhow::Result<Vec<(usize, Arc<FileMetadata>)>> {
        let guard = self.versions.log_lock();
        let compactions = self.in_progress_compactions();
        let current = self.versions.current_version();
        let base_level = current.base_level();

        let mut edit = VersionEdit {
            min_unflushed_log_num,
            ..Default::default()
        };
        let mut metrics: BTreeMap<usize, LevelMetrics> = BTreeMap::new();
        let mut placed = Vec::with_capacity(files.len());
        for meta in files {
            let level = crate::ingest::ingest_target_level(
                &self.versions,
                &current,
                base_level,
                &compactions,
                meta,
            )?;
            edit.new_files.push((level, meta.clone()));
            placed.push((level, meta.clone()));
            let entry = metrics.entry(level).or_default();
            entry.file_count += 1;
            entry.bytes += meta.size;
            if ingested {
                entry.bytes_ingested += meta.size;
                entry.tables_ingested += 1;
            }
        }
        self.versions.log_and_apply(guard, job_id, edit, metrics)?;
        Ok(placed)
    }

    fn flush_one(&self, entry: &Arc<FlushableEntry>) -> anyhow::Result<()> {
        let job_id = self.next_job_id();
        let min_unflushed_log_num = {
            let state = self.state.lock();
            debug_assert!(Arc::ptr_eq(&state.queue[0], entry));
            Some(state.queue[1].log_num)
        };

        match &entry.flushable {
            Flushable::Mem(mem) if mem.is_empty() => {
                let guard = self.versions.log_lock();
                self.versions.log_and_apply(
                    guard,
                    job_id,
                    VersionEdit {
                        min_unflushed_log_num,
                        ..Default::default()
                    },
                    BTreeMap::new(),
                )?;
            }
            Flushable::Mem(mem) => {
                let file_num = self.versions.next_file_num();
                let meta = self.build_table_from_memtable(file_num, mem)?;
                self.versions.objstore().sync_dir()?;
                let placed =
                    self.place_and_publish(job_id, &[meta], min_unflushed_log_num, false)?;
                tracing::info!(
                    job = job_id,
                    file_num,
                    level = placed[0].0,
                    "flushed memtable"
                );
            }
            Flushable::Ingested(ing) => {
                let files: Vec<Arc<FileMetadata>> = ing.files().to_vec();
                let placed =
                    self.place_and_publish(job_id, &files, min_unflushed_log_num, true)?;
                for meta in &files {
                    self.versions.unref_file(meta);
                }
                tracing::info!(
                    job = job_id,
                    tables = placed.len(),
                    "flushed ingested tables into the tree"
                );
            }
        }

        {
            let mut state = self.state.lock();
            let pos = state
                .queue
                .iter()
                .position(|e| Arc::ptr_eq(e, entry))
                .expect("flushed entry still queued");
            state.queue.remove(pos);
        }
        entry.flushed.signal();

        self.versions.remove_obsolete_files();
        if !self.options.disable_wal {
            if let Err(err) =
                Wal::remove_obsolete(&self.dir, self.versions.min_unflushed_log_num())
            {
                tracing::warn!(error = %err, "failed to remove obsolete wal segments");
            }
        }
        self.maybe_schedule_compaction();
        Ok(())
    }
}

fn flush_loop(inner: Arc<DbInner>) {
    loop {
        let entry = {
            let mut state = inner.state.lock();
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                if state.queue.len() > 1 {
                    break state.queue[0].clone();
                }
                inner.flush_cv.wait(&mut state);
            }
        };
        if let Err(err) = inner.flush_one(&entry) {
            tracing::error!(error = %err, "flush failed; retrying");
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}
