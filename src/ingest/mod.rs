//! Atomic ingestion of externally built tables.
//!
//! Ingestion incorporates a set of immutable, sorted, externally written
//! table files into the live tree as if their contents had been applied
//! through a single write batch, without rewriting their bytes. The steps:
//!
//! 1. Allocate file numbers for every table being ingested.
//! 2. Load and validate the metadata of each table; elide empty ones.
//! 3. Sort the tables by smallest key, verifying pairwise non-overlap.
//! 4. Hardlink (or copy) the tables into the object store.
//! 5. Through the commit pipeline, allocate one sequence number per table.
//!    In `prepare`, find the newest flushable that overlaps the input; either
//!    force it to flush or splice the tables into the queue above it as a
//!    flushable entry.
//! 6. Stamp the allocated sequence numbers into the descriptors.
//! 7. Wait for the overlapping flushable to drain, if one was forced.
//! 8. Pick a target level for every table and publish one version edit.
//! 9. Publish the ingestion sequence numbers to readers.
//!
//! Overlap against existing data is judged by an approximate probe: a
//! table's bounds stand in for its full interior, so false positives cause
//! shallower placement, never incorrect results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::commit::SeqNumAssignment;
use crate::db::{Db, DbInner, DbState, FormatMajorVersion};
use crate::error::IngestError;
use crate::event::{IngestedTable, TableCreateInfo, TableIngestInfo, TableValidatedInfo};
use crate::internal_key::{table_key_cmp, InternalKey, KeyKind};
use crate::iterator::{
    LevelPointIter, LevelSpanIter, PointIterator, ReaderProvider, SpanIterator, SpanKind,
    SpanVecIter,
};
use crate::memtable::{Flushable, FlushableEntry, IngestedFlushable};
use crate::objstore::ObjectStore;
use crate::sst::{ReaderOptions, TableReader};
use crate::version::{FileMetadata, Version, VersionSet, NUM_LEVELS};
use crate::wal::WalRecord;

/// Where the bytes of an ingest landed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Total bytes in the ingested tables.
    pub bytes: u64,
    /// Approximate bytes placed at L0.
    pub approx_bytes_into_l0: u64,
}

fn ingest_validate_key(key: &InternalKey) -> Result<(), IngestError> {
    if key.kind == KeyKind::Invalid {
        return Err(IngestError::Corruption(format!(
            "external table has corrupted key: {:?}",
            key.user_key
        )));
    }
    if key.seqno != 0 {
        return Err(IngestError::Corruption(format!(
            "external table has non-zero seqnum: {:?}@{}",
            key.user_key, key.seqno
        )));
    }
    Ok(())
}

/// Loads one external table into a descriptor. Returns `Ok(None)` when the
/// table holds neither point nor range keys.
pub(crate) fn ingest_load_one(
    fmv: FormatMajorVersion,
    path: &Path,
    file_num: u64,
) -> Result<Option<FileMetadata>, IngestError> {
    let reader = TableReader::open(path)?;

    // Refuse tables with formats this database cannot open.
    let format = reader.table_format();
    let (min, max) = (fmv.min_table_format(), fmv.max_table_format());
    if format < min || format > max {
        return Err(IngestError::FormatMismatch { format, min, max });
    }

    let mut meta = FileMetadata::new(file_num, reader.size());
    meta.set_stats_from_properties(reader.properties());

    {
        let mut iter = reader.point_iter();
        if let Some(first) = iter.first() {
            ingest_validate_key(&first)?;
            let last = iter.last().ok_or_else(|| {
                IngestError::Corruption("table lost its last point key".to_string())
            })?;
            ingest_validate_key(&last)?;
            meta.extend_point_key_bounds(first, last);
        }
        if let Some(err) = iter.error() {
            return Err(IngestError::Corruption(format!("{err:#}")));
        }
    }

    // Range deletions widen the point-key bounds: the start key of each
    // span carries the sort bound, the end of the last span is exclusive.
    {
        let spans = reader.range_del_spans();
        if let (Some(first), Some(last)) = (spans.first(), spans.last()) {
            ingest_validate_key(&first.start)?;
            ingest_validate_key(&last.start)?;
            meta.extend_point_key_bounds(first.start.clone(), last.end_sentinel());
        }
    }

    // Range keys are pre-fragmented and non-overlapping within a table, so
    // the end of the last span is the table's upper range-key bound.
    {
        let spans = reader.range_key_spans();
        if let (Some(first), Some(last)) = (spans.first(), spans.last()) {
            ingest_validate_key(&first.start)?;
            ingest_validate_key(&last.start)?;
            meta.extend_range_key_bounds(first.start.clone(), last.end_sentinel());
        }
    }

    if !meta.has_point_keys() && !meta.has_range_keys() {
        return Ok(None);
    }

    meta.validate()
        .map_err(|err| IngestError::Corruption(format!("{err:#}")))?;
    Ok(Some(meta))
}

/// Loads every input, dropping empty tables and their paths in lockstep.
fn ingest_load(
    fmv: FormatMajorVersion,
    paths: &[PathBuf],
    pending: &[u64],
) -> Result<(Vec<FileMetadata>, Vec<PathBuf>), IngestError> {
    let mut meta = Vec::with_capacity(paths.len());
    let mut kept = Vec::with_capacity(paths.len());
    for (path, file_num) in paths.iter().zip(pending) {
        if let Some(m) = ingest_load_one(fmv, path, *file_num)? {
            meta.push(m);
            kept.push(path.clone());
        }
    }
    Ok((meta, kept))
}

/// Sorts descriptors by smallest key, co-permuting paths, and verifies the
/// inputs are pairwise non-overlapping under the sentinel-aware comparator.
pub(crate) fn ingest_sort_and_verify(
    meta: &mut Vec<FileMetadata>,
    paths: &mut Vec<PathBuf>,
) -> Result<(), IngestError> {
    if meta.len() <= 1 {
        return Ok(());
    }
    let mut zipped: Vec<(FileMetadata, PathBuf)> =
        meta.drain(..).zip(paths.drain(..)).collect();
    zipped.sort_by(|a, b| a.0.smallest.user_key.cmp(&b.0.smallest.user_key));
    for (m, p) in zipped {
        meta.push(m);
        paths.push(p);
    }
    for i in 1..meta.len() {
        if table_key_cmp(&meta[i - 1].largest, &meta[i].smallest).is_ge() {
            return Err(IngestError::Overlap);
        }
    }
    Ok(())
}

/// Installs every input into the object store; on failure, removes the
/// objects installed so far and surfaces the original error.
fn ingest_link(
    job_id: u64,
    objstore: &ObjectStore,
    listener: &dyn crate::event::EventListener,
    paths: &[PathBuf],
    meta: &[FileMetadata],
) -> anyhow::Result<()> {
    for (i, (path, m)) in paths.iter().zip(meta).enumerate() {
        match objstore.link_or_copy_from_local(path, m.file_num) {
            Ok(installed) => {
                listener.table_created(&TableCreateInfo {
                    job_id,
                    reason: "ingesting",
                    path: installed,
                    file_num: m.file_num,
                });
            }
            Err(err) => {
                let linked: Vec<u64> = meta[..i].iter().map(|m| m.file_num).collect();
                if let Err(cleanup_err) = ingest_cleanup(objstore, &linked) {
                    tracing::warn!(job = job_id, error = %cleanup_err, "ingest cleanup failed");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Best-effort removal of installed objects; attempts every file and
/// returns the first error.
fn ingest_cleanup(objstore: &ObjectStore, file_nums: &[u64]) -> anyhow::Result<()> {
    let mut first_err = None;
    for &file_num in file_nums {
        if let Err(err) = objstore.remove(file_num) {
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Stamps `base + i` into descriptor `i`. An exclusive-sentinel largest
/// bound keeps its maximum sequence number: rewriting it would demote the
/// bound to inclusive and silently widen the table. The largest range-key
/// bound is always such a sentinel and is never rewritten.
pub(crate) fn ingest_update_seqno(
    base: u64,
    meta: &mut [FileMetadata],
) -> anyhow::Result<()> {
    let mut seqno = base;
    for m in meta {
        if let Some(k) = &m.smallest_point_key {
            m.smallest_point_key = Some(k.with_seqno(seqno));
        }
        if let Some(k) = &m.smallest_range_key {
            m.smallest_range_key = Some(k.with_seqno(seqno));
        }
        m.smallest = m.smallest.with_seqno(seqno);
        if let Some(k) = &m.largest_point_key {
            if !k.is_exclusive_sentinel() {
                m.largest_point_key = Some(k.with_seqno(seqno));
            }
        }
        if !m.largest.is_exclusive_sentinel() {
            m.largest = m.largest.with_seqno(seqno);
        }
        m.smallest_seqno = seqno;
        m.largest_seqno = seqno;
        m.validate()?;
        seqno += 1;
    }
    Ok(())
}

/// Shared overlap probe.
///
/// The point seek may surface a synthetic boundary rather than a real
/// point. Comparing that boundary `b` against the table's largest bound
/// `L`:
/// 1. `b < L`: since `b >= smallest` from the seek, always overlapping.
/// 2. `b > L`: indeterminate, fall through to the span checks.
/// 3. `b == L`, `L` not a sentinel: as case 1.
/// 4. `b == L`, `L` a sentinel: ranges `[i, k)` and `[j, k)` always
///    overlap.
pub(crate) fn overlap_with_iterator<'a>(
    point: &mut (dyn PointIterator + 'a),
    mut range_del: Option<&mut (dyn SpanIterator + 'a)>,
    mut range_key: Option<&mut (dyn SpanIterator + 'a)>,
    meta: &FileMetadata,
) -> bool {
    if let Some(key) = point.seek_ge(meta.smallest.user_key.as_ref()) {
        if table_key_cmp(&key, &meta.largest).is_le() {
            return true;
        }
    }
    if let Some(iter) = range_key.as_deref_mut() {
        if span_overlap(iter, meta) {
            return true;
        }
    }
    if let Some(iter) = range_del.as_deref_mut() {
        if span_overlap(iter, meta) {
            return true;
        }
    }
    // An errored iterator may have hidden an overlap.
    point.error().is_some()
        || range_del.map_or(false, |i| i.error().is_some())
        || range_key.map_or(false, |i| i.error().is_some())
}

fn span_overlap(iter: &mut dyn SpanIterator, meta: &FileMetadata) -> bool {
    let mut span = iter.seek_lt(meta.smallest.user_key.as_ref());
    if span.is_none() {
        span = iter.next();
    }
    while let Some(s) = span {
        if !s.is_empty() {
            if table_key_cmp(&s.start, &meta.largest).is_gt() {
                // Spans are sorted by start; nothing further can overlap.
                return false;
            }
            if s.end.as_ref() > meta.smallest.user_key.as_ref() {
                // Span ends are exclusive, hence strict.
                return true;
            }
        }
        span = iter.next();
    }
    false
}

/// Whether any descriptor's bounds are shadowed by `flushable`.
pub(crate) fn ingest_memtable_overlaps(flushable: &Flushable, meta: &[FileMetadata]) -> bool {
    for m in meta {
        let mut point = flushable.point_iter();
        let mut range_del = flushable.range_del_iter();
        let mut range_key = flushable.range_key_iter();
        let range_del_ref = range_del.as_deref_mut();
        let range_key_ref = range_key.as_deref_mut();
        if overlap_with_iterator(&mut *point, range_del_ref, range_key_ref, m) {
            return true;
        }
    }
    false
}

/// Deepest level at which `meta` can be installed.
///
/// A table placed at level `T > 0` must have no data overlap with any level
/// `<= T` (the sequence number invariant) and no boundary overlap with
/// level `T` itself (the non-overlap invariant; L0 exempt). Boundary
/// overlap with the output range of an in-progress compaction targeting
/// `T` also disqualifies `T`, but not deeper levels.
///
/// Data overlap is judged by the approximate probe; see the module docs.
/// Must run under the manifest edit lock so the version, the base level,
/// and the compaction set are a consistent snapshot.
pub(crate) fn ingest_target_level(
    versions: &VersionSet,
    version: &Version,
    base_level: usize,
    compactions: &[crate::compaction::CompactionInfo],
    meta: &FileMetadata,
) -> anyhow::Result<usize> {
    let mut target = 0usize;

    // L0 tolerates boundary overlap, so only data overlap matters there.
    for f0 in version.files(0) {
        if table_key_cmp(&meta.smallest, &f0.largest).is_gt()
            || table_key_cmp(&meta.largest, &f0.smallest).is_lt()
        {
            continue;
        }
        let reader = versions.reader(f0)?;
        let mut point = reader.point_iter();
        let mut range_del = span_iter_of(reader.range_del_spans());
        let mut range_key = span_iter_of(reader.range_key_spans());
        let range_del_ref = range_del.as_deref_mut();
        let range_key_ref = range_key.as_deref_mut();
        if overlap_with_iterator(&mut point, range_del_ref, range_key_ref, meta) {
            return Ok(0);
        }
    }

    for level in base_level..NUM_LEVELS {
        let files = version.files(level);
        let mut point = LevelPointIter::new(versions, files);
        let mut range_del: Box<dyn SpanIterator> =
            Box::new(LevelSpanIter::new(versions, files, SpanKind::RangeDel));
        let mut range_key: Box<dyn SpanIterator> =
            Box::new(LevelSpanIter::new(versions, files, SpanKind::RangeKey));
        if overlap_with_iterator(
            &mut point,
            Some(&mut *range_del),
            Some(&mut *range_key),
            meta,
        ) {
            // Data overlap: the table stays at the shallower level chosen
            // so far.
            return Ok(target);
        }

        let boundary = version.overlaps(
            level,
            meta.smallest.user_key.as_ref(),
            meta.largest.user_key.as_ref(),
            meta.largest.is_exclusive_sentinel(),
        );
        if !boundary.is_empty() {
            continue;
        }

        // Keys a compaction writes into `level` come from levels whose data
        // overlap already tested negative, so only its output range needs
        // checking.
        let compaction_overlap = compactions.iter().any(|c| {
            c.output_level == level
                && c.overlaps_user_range(
                    meta.smallest.user_key.as_ref(),
                    meta.largest.user_key.as_ref(),
                )
        });
        if !compaction_overlap {
            target = level;
        }
    }
    Ok(target)
}

fn span_iter_of(spans: &[crate::internal_key::Span]) -> Option<Box<dyn SpanIterator>> {
    if spans.is_empty() {
        None
    } else {
        Some(Box::new(SpanVecIter::new(spans.to_vec())))
    }
}

/// Rebuilds an ingested flushable from its WAL record during recovery. The
/// files were linked into the object store before the record was written.
pub(crate) fn rebuild_ingested_flushable(
    versions: &VersionSet,
    fmv: FormatMajorVersion,
    seqno: u64,
    file_nums: &[u64],
) -> anyhow::Result<IngestedFlushable> {
    let mut meta = Vec::with_capacity(file_nums.len());
    for &file_num in file_nums {
        let path = versions.objstore().path_of(file_num);
        let m = ingest_load_one(fmv, &path, file_num)
            .with_context(|| format!("reload ingested table {file_num}"))?
            .ok_or_else(|| anyhow::anyhow!("ingested table {file_num} is empty"))?;
        meta.push(m);
    }
    ingest_update_seqno(seqno, &mut meta)?;
    let (files, readers) = open_ingested_readers(versions.objstore(), meta)?;
    for f in &files {
        versions.ref_file(f);
    }
    Ok(IngestedFlushable::new(files, readers))
}

fn open_ingested_readers(
    objstore: &ObjectStore,
    meta: Vec<FileMetadata>,
) -> anyhow::Result<(Vec<Arc<FileMetadata>>, Vec<Arc<TableReader>>)> {
    let files: Vec<Arc<FileMetadata>> = meta.into_iter().map(Arc::new).collect();
    let mut readers = Vec::with_capacity(files.len());
    for f in &files {
        let path = objstore.path_of(f.file_num);
        let reader = TableReader::open_with_options(
            &path,
            ReaderOptions {
                global_seqno: f.global_seqno(),
            },
        )
        .with_context(|| format!("open ingested table {}", path.display()))?;
        readers.push(Arc::new(reader));
    }
    Ok((files, readers))
}

enum IngestStep {
    Preparing,
    AwaitingFlush(Arc<FlushableEntry>),
    Spliced,
    Failed,
}

/// Two-phase ingest state, driven by the commit pipeline.
struct IngestJob<'d> {
    db: &'d Db,
    job_id: u64,
    meta: Vec<FileMetadata>,
    step: IngestStep,
    base_seqno: u64,
    err: Option<anyhow::Error>,
    installed: Vec<(usize, Arc<FileMetadata>)>,
    spliced: Vec<Arc<FileMetadata>>,
}

impl SeqNumAssignment for IngestJob<'_> {
    // Runs under the commit lock; takes the database lock itself.
    fn prepare(&mut self, seqno: u64) {
        self.base_seqno = seqno;
        let inner = &self.db.inner;
        let mut state = inner.state.lock();

        // Walk the queue newest to oldest; the first overlapping flushable
        // is the one ingestion must order itself after.
        let overlapping = state
            .queue
            .iter()
            .rev()
            .find(|e| ingest_memtable_overlaps(&e.flushable, &self.meta))
            .cloned();
        let Some(entry) = overlapping else {
            return;
        };

        let must_flush = state.queue.len() >= inner.options.memtable_stop_writes_threshold
            || inner.options.format_major_version < FormatMajorVersion::FlushableIngest
            || inner.options.disable_ingest_as_flushable;
        if must_flush {
            let is_mutable = state
                .queue
                .last()
                .is_some_and(|last| Arc::ptr_eq(last, &entry));
            if is_mutable {
                if let Err(err) = inner.rotate_memtable_locked(&mut state) {
                    self.err = Some(err);
                    self.step = IngestStep::Failed;
                    return;
                }
            }
            entry.force_flush();
            drop(state);
            inner.flush_cv.notify_all();
            self.step = IngestStep::AwaitingFlush(entry);
        } else {
            // Few enough memtables queued: slide the tables on top of them
            // instead of waiting out a flush.
            let meta = std::mem::take(&mut self.meta);
            match self.db.handle_ingest_as_flushable(&mut state, meta, seqno) {
                Ok(spliced) => {
                    self.spliced = spliced;
                    self.step = IngestStep::Spliced;
                }
                Err(err) => {
                    self.err = Some(err);
                    self.step = IngestStep::Failed;
                }
            }
            drop(state);
            inner.flush_cv.notify_all();
        }
    }

    // Commit lock still held; the database lock is taken as needed.
    fn apply(&mut self, seqno: u64) {
        match self.step {
            IngestStep::Spliced | IngestStep::Failed => return,
            _ => {}
        }
        // Stamping here persists through the version edit; the table bytes
        // stay untouched.
        if let Err(err) = ingest_update_seqno(seqno, &mut self.meta) {
            self.err = Some(err);
            return;
        }
        if let IngestStep::AwaitingFlush(entry) = &self.step {
            entry.flushed.wait();
        }
        let meta = std::mem::take(&mut self.meta);
        match self.db.ingest_apply(self.job_id, meta) {
            Ok(placed) => self.installed = placed,
            Err(err) => self.err = Some(err),
        }
    }
}

impl Db {
    /// Ingests a set of externally built tables. Atomic and semantically
    /// equivalent to a single write batch holding all of their contents;
    /// the bytes are hardlinked or copied, never rewritten. Inputs must be
    /// synced by their producer. On success the original paths are
    /// removed.
    pub fn ingest<P: AsRef<Path>>(&self, paths: &[P]) -> anyhow::Result<()> {
        self.ingest_with_stats(paths).map(|_| ())
    }

    /// Same as `ingest`, additionally reporting where the bytes landed.
    pub fn ingest_with_stats<P: AsRef<Path>>(&self, paths: &[P]) -> anyhow::Result<IngestStats> {
        self.check_open();
        if self.inner.options.read_only {
            return Err(IngestError::ReadOnly.into());
        }
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.ingest_inner(paths)
    }

    fn ingest_inner(&self, paths: Vec<PathBuf>) -> anyhow::Result<IngestStats> {
        let inner = &self.inner;
        let job_id = inner.next_job_id();

        // Allocate file numbers up front; they are out of order with
        // sequence numbers, which is why L0 orders by seqno instead.
        let pending: Vec<u64> = paths.iter().map(|_| inner.versions.next_file_num()).collect();

        let fmv = inner.options.format_major_version;
        let (mut meta, mut paths) = ingest_load(fmv, &paths, &pending)?;
        if meta.is_empty() {
            // Every input was empty.
            return Ok(IngestStats::default());
        }
        ingest_sort_and_verify(&mut meta, &mut paths)?;

        // Link before allocating a sequence number; the objects are
        // unreferenced by any version, so a failure from here on is
        // reversible. Sync the store so a published edit can never
        // reference an unsynced object.
        ingest_link(job_id, inner.versions.objstore(), &*inner.listener, &paths, &meta)?;
        inner.versions.objstore().sync_dir()?;

        let file_nums: Vec<u64> = meta.iter().map(|m| m.file_num).collect();
        let count = meta.len() as u64;
        let mut job = IngestJob {
            db: self,
            job_id,
            meta,
            step: IngestStep::Preparing,
            base_seqno: 0,
            err: None,
            installed: Vec::new(),
            spliced: Vec::new(),
        };
        inner.commit.allocate_seq_num(count, &mut job);

        let err = job.err.take();
        if let Some(err) = &err {
            if let Err(cleanup_err) = ingest_cleanup(inner.versions.objstore(), &file_nums) {
                tracing::warn!(job = job_id, error = %cleanup_err, "ingest cleanup failed");
            }
        } else {
            // The objects are links or copies; the originals are now
            // redundant.
            for path in &paths {
                if let Err(remove_err) = std::fs::remove_file(path) {
                    tracing::warn!(
                        job = job_id,
                        path = %path.display(),
                        error = %remove_err,
                        "ingest failed to remove original file"
                    );
                }
            }
        }

        let flushable = matches!(job.step, IngestStep::Spliced);
        let mut stats = IngestStats::default();
        let tables: Vec<IngestedTable> = if flushable {
            job.spliced
                .iter()
                .map(|m| IngestedTable {
                    file_num: m.file_num,
                    size: m.size,
                    level: -1,
                })
                .collect()
        } else {
            job.installed
                .iter()
                .map(|(level, m)| {
                    stats.bytes += m.size;
                    if *level == 0 {
                        stats.approx_bytes_into_l0 += m.size;
                    }
                    IngestedTable {
                        file_num: m.file_num,
                        size: m.size,
                        level: *level as i32,
                    }
                })
                .collect()
        };
        inner.listener.table_ingested(&TableIngestInfo {
            job_id,
            global_seqno: job.base_seqno,
            bytes: if flushable {
                tables.iter().map(|t| t.size).sum()
            } else {
                stats.bytes
            },
            approx_bytes_into_l0: stats.approx_bytes_into_l0,
            tables,
            err: err.as_ref().map(|e| format!("{e:#}")),
            flushable,
        });

        match err {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// Splices stamped descriptors into the flushable queue above every
    /// memtable. Holds both the commit and database locks (the caller's),
    /// so the relative order of WAL rotation and memtable rotation is
    /// free; the record lands in its own segment for replay simplicity.
    pub(crate) fn handle_ingest_as_flushable(
        &self,
        state: &mut DbState,
        mut meta: Vec<FileMetadata>,
        seqno: u64,
    ) -> anyhow::Result<Vec<Arc<FileMetadata>>> {
        let inner = &self.inner;
        // The version edit that would persist the stamp is deferred to the
        // eventual flush; the WAL record carries it until then.
        ingest_update_seqno(seqno, &mut meta)?;
        let (files, readers) = open_ingested_readers(inner.versions.objstore(), meta)?;
        for f in &files {
            inner.versions.ref_file(f);
        }

        let log_num = if inner.options.disable_wal {
            state.queue.last().map(|e| e.log_num).unwrap_or(0)
        } else {
            let ingest_log = inner.versions.next_file_num();
            inner.wal.rotate(ingest_log)?;
            inner.wal.append(&WalRecord::IngestedTables {
                seqno,
                file_nums: files.iter().map(|f| f.file_num).collect(),
            })?;
            ingest_log
        };

        let flushable = Arc::new(IngestedFlushable::new(files.clone(), readers));
        let entry = FlushableEntry::new(Flushable::Ingested(flushable), log_num);
        entry.force_flush();
        state.queue.push(entry);

        // Subsequent writes go to a fresh memtable whose sequence numbers
        // continue past the ingest range.
        self.inner.rotate_memtable_locked(state)?;
        Ok(files)
    }

    /// Assigns every descriptor its target level and publishes one version
    /// edit containing the whole ingest.
    fn ingest_apply(
        &self,
        job_id: u64,
        meta: Vec<FileMetadata>,
    ) -> anyhow::Result<Vec<(usize, Arc<FileMetadata>)>> {
        let files: Vec<Arc<FileMetadata>> = meta.into_iter().map(Arc::new).collect();
        let placed = self.inner.place_and_publish(job_id, &files, None, true)?;
        self.inner.versions.remove_obsolete_files();
        self.inner.maybe_schedule_compaction();
        self.inner.maybe_validate_tables(&placed);
        Ok(placed)
    }
}

impl DbInner {
    /// Queues freshly installed tables for block-checksum validation when
    /// the feature is enabled, and starts the singleton worker.
    pub(crate) fn maybe_validate_tables(
        self: &Arc<Self>,
        new_files: &[(usize, Arc<FileMetadata>)],
    ) {
        if !self.options.validate_on_ingest {
            return;
        }
        let mut state = self.state.lock();
        state.validation.pending.extend(new_files.iter().cloned());
        if state.validation.validating || state.validation.pending.is_empty() {
            return;
        }
        state.validation.validating = true;
        let inner = self.clone();
        std::thread::Builder::new()
            .name("graftdb-validate".to_string())
            .spawn(move || validate_tables(inner))
            .expect("spawn validation worker");
    }
}

/// Validation worker: drains the pending queue, re-reading every block of
/// every table and verifying checksums. A table that moved to a deeper
/// level since ingestion is chased there; a table no longer in any level
/// is skipped. A checksum failure is fatal corruption.
fn validate_tables(inner: Arc<DbInner>) {
    loop {
        let (pending, job_id) = {
            let mut state = inner.state.lock();
            if state.validation.pending.is_empty() {
                state.validation.validating = false;
                return;
            }
            let pending = std::mem::take(&mut state.validation.pending);
            let job_id = state.next_job_id;
            state.next_job_id += 1;
            (pending, job_id)
        };

        let current = inner.versions.current_version();
        for (recorded_level, meta) in pending {
            let level = if current.contains(recorded_level, meta.file_num) {
                recorded_level
            } else {
                // Tables only move down.
                match (recorded_level + 1..NUM_LEVELS)
                    .find(|l| current.contains(*l, meta.file_num))
                {
                    Some(level) => level,
                    None => continue,
                }
            };

            let result = inner
                .versions
                .reader(&meta)
                .and_then(|r| r.validate_block_checksums().map_err(Into::into));
            if let Err(err) = result {
                tracing::error!(
                    job = job_id,
                    file_num = meta.file_num,
                    error = %err,
                    "corruption detected during ingestion validation"
                );
                panic!("graftdb: corruption detected during ingestion validation: {err:#}");
            }
            inner.listener.table_validated(&TableValidatedInfo {
                job_id,
                file_num: meta.file_num,
                level: level as i32,
            });
        }
    }
}
