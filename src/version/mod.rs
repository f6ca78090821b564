//! Versions and the version set.
//!
//! A `Version` is an immutable snapshot of the table files at every level.
//! L0 may hold overlapping files and is searched newest-first; levels below
//! L0 are pairwise non-overlapping and sorted by smallest key. Publishing a
//! new version appends a `VersionEdit` to the manifest, fsyncs it, and
//! swaps the current pointer; readers hold `Arc` snapshots and are never
//! blocked by publication.

pub mod manifest;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::compaction::LevelMetrics;
use crate::internal_key::{table_key_cmp, InternalKey, KeyKind};
use crate::iterator::ReaderProvider;
use crate::objstore::ObjectStore;
use crate::sst::{ReaderOptions, TableProperties, TableReader};
use manifest::{
    DeletedFileRecord, Manifest, ManifestRecord, NewFileRecord, VersionEditRecord,
};

pub const NUM_LEVELS: usize = 7;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Descriptor of one table file. Created by the ingestion loader or the
/// flush path, mutated only by sequence stamping and reference accounting,
/// immutable once installed in a version.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_num: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_point_key: Option<InternalKey>,
    pub largest_point_key: Option<InternalKey>,
    pub smallest_range_key: Option<InternalKey>,
    pub largest_range_key: Option<InternalKey>,
    pub smallest_seqno: u64,
    pub largest_seqno: u64,
    /// Wall-clock seconds.
    pub creation_time: u64,
    pub point_del_bytes_estimate: u64,
    pub range_del_bytes_estimate: u64,
    #[serde(skip)]
    pub refs: AtomicI32,
}

impl Clone for FileMetadata {
    fn clone(&self) -> Self {
        Self {
            file_num: self.file_num,
            size: self.size,
            smallest: self.smallest.clone(),
            largest: self.largest.clone(),
            smallest_point_key: self.smallest_point_key.clone(),
            largest_point_key: self.largest_point_key.clone(),
            smallest_range_key: self.smallest_range_key.clone(),
            largest_range_key: self.largest_range_key.clone(),
            smallest_seqno: self.smallest_seqno,
            largest_seqno: self.largest_seqno,
            creation_time: self.creation_time,
            point_del_bytes_estimate: self.point_del_bytes_estimate,
            range_del_bytes_estimate: self.range_del_bytes_estimate,
            refs: AtomicI32::new(self.refs.load(Ordering::Relaxed)),
        }
    }
}

impl FileMetadata {
    pub fn new(file_num: u64, size: u64) -> Self {
        let placeholder = InternalKey::new(Bytes::new(), 0, KeyKind::Invalid);
        Self {
            file_num,
            size,
            smallest: placeholder.clone(),
            largest: placeholder,
            smallest_point_key: None,
            largest_point_key: None,
            smallest_range_key: None,
            largest_range_key: None,
            smallest_seqno: 0,
            largest_seqno: 0,
            creation_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            point_del_bytes_estimate: 0,
            range_del_bytes_estimate: 0,
            refs: AtomicI32::new(0),
        }
    }

    pub fn has_point_keys(&self) -> bool {
        self.smallest_point_key.is_some()
    }

    pub fn has_range_keys(&self) -> bool {
        self.smallest_range_key.is_some()
    }

    pub fn extend_point_key_bounds(&mut self, smallest: InternalKey, largest: InternalKey) {
        extend_bounds(
            &mut self.smallest_point_key,
            &mut self.largest_point_key,
            smallest,
            largest,
        );
        self.recompute_overall_bounds();
    }

    pub fn extend_range_key_bounds(&mut self, smallest: InternalKey, largest: InternalKey) {
        extend_bounds(
            &mut self.smallest_range_key,
            &mut self.largest_range_key,
            smallest,
            largest,
        );
        self.recompute_overall_bounds();
    }

    /// Overall bounds are the comparator-min/max of the per-category bounds.
    fn recompute_overall_bounds(&mut self) {
        let mut smallest: Option<&InternalKey> = None;
        let mut largest: Option<&InternalKey> = None;
        for candidate in [&self.smallest_point_key, &self.smallest_range_key]
            .into_iter()
            .flatten()
        {
            if smallest.map_or(true, |cur| table_key_cmp(candidate, cur).is_lt()) {
                smallest = Some(candidate);
            }
        }
        for candidate in [&self.largest_point_key, &self.largest_range_key]
            .into_iter()
            .flatten()
        {
            if largest.map_or(true, |cur| table_key_cmp(candidate, cur).is_gt()) {
                largest = Some(candidate);
            }
        }
        if let (Some(s), Some(l)) = (smallest, largest) {
            let (s, l) = (s.clone(), l.clone());
            self.smallest = s;
            self.largest = l;
        }
    }

    pub fn set_stats_from_properties(&mut self, props: &TableProperties) {
        self.point_del_bytes_estimate = props.point_del_bytes;
        self.range_del_bytes_estimate = props.range_del_bytes;
    }

    /// Sequence number substituted for zero-stamped keys when reading this
    /// table. Set for ingested tables, where every key carries the same
    /// stamp.
    pub fn global_seqno(&self) -> Option<u64> {
        (self.smallest_seqno == self.largest_seqno && self.smallest_seqno > 0)
            .then_some(self.smallest_seqno)
    }

    /// Cross-validates that the bounds were set consistently.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.has_point_keys() && !self.has_range_keys() {
            anyhow::bail!("file {} has no bounds", self.file_num);
        }
        if table_key_cmp(&self.smallest, &self.largest).is_gt() {
            anyhow::bail!("file {}: smallest > largest", self.file_num);
        }
        for (smallest, largest) in [
            (&self.smallest_point_key, &self.largest_point_key),
            (&self.smallest_range_key, &self.largest_range_key),
        ] {
            match (smallest, largest) {
                (None, None) => {}
                (Some(s), Some(l)) => {
                    if table_key_cmp(s, l).is_gt() {
                        anyhow::bail!("file {}: category smallest > largest", self.file_num);
                    }
                    if table_key_cmp(s, &self.smallest).is_lt()
                        || table_key_cmp(l, &self.largest).is_gt()
                    {
                        anyhow::bail!(
                            "file {}: category bounds outside overall bounds",
                            self.file_num
                        );
                    }
                }
                _ => anyhow::bail!("file {}: half-set category bounds", self.file_num),
            }
        }
        if self.smallest_seqno > self.largest_seqno {
            anyhow::bail!("file {}: smallest_seqno > largest_seqno", self.file_num);
        }
        Ok(())
    }

    /// Whether `user_key` falls inside this file's bounds; an exclusive
    /// sentinel largest excludes its own user key.
    pub fn contains_user_key(&self, user_key: &[u8]) -> bool {
        if user_key < self.smallest.user_key.as_ref() {
            return false;
        }
        match user_key.cmp(self.largest.user_key.as_ref()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => !self.largest.is_exclusive_sentinel(),
            std::cmp::Ordering::Greater => false,
        }
    }

    /// Boundary-interval intersection with `[smallest, largest]`, where
    /// `largest` is exclusive when it came from a sentinel bound.
    pub fn overlaps_user_range(
        &self,
        smallest: &[u8],
        largest: &[u8],
        largest_exclusive: bool,
    ) -> bool {
        let below = match self.largest.user_key.as_ref().cmp(smallest) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.largest.is_exclusive_sentinel(),
            std::cmp::Ordering::Greater => false,
        };
        if below {
            return false;
        }
        let above = match self.smallest.user_key.as_ref().cmp(largest) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => largest_exclusive,
            std::cmp::Ordering::Less => false,
        };
        !above
    }
}

fn extend_bounds(
    smallest_slot: &mut Option<InternalKey>,
    largest_slot: &mut Option<InternalKey>,
    smallest: InternalKey,
    largest: InternalKey,
) {
    match smallest_slot {
        None => *smallest_slot = Some(smallest),
        Some(cur) => {
            if table_key_cmp(&smallest, cur).is_lt() {
                *smallest_slot = Some(smallest);
            }
        }
    }
    match largest_slot {
        None => *largest_slot = Some(largest),
        Some(cur) => {
            if table_key_cmp(&largest, cur).is_gt() {
                *largest_slot = Some(largest);
            }
        }
    }
}

/// Immutable snapshot of the table files at every level.
#[derive(Clone)]
pub struct Version {
    levels: Vec<Vec<Arc<FileMetadata>>>,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.levels[level]
    }

    pub fn all_files(&self) -> impl Iterator<Item = (usize, &Arc<FileMetadata>)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.iter().map(move |f| (level, f)))
    }

    /// Shallowest non-L0 level eligible for new writes: the level directly
    /// above the shallowest occupied level, or the bottom when everything
    /// below L0 is empty.
    pub fn base_level(&self) -> usize {
        match (1..NUM_LEVELS).find(|level| !self.levels[*level].is_empty()) {
            Some(occupied) => occupied.saturating_sub(1).max(1),
            None => NUM_LEVELS - 1,
        }
    }

    pub fn contains(&self, level: usize, file_num: u64) -> bool {
        self.levels[level].iter().any(|f| f.file_num == file_num)
    }

    /// Files at `level` whose boundary interval intersects
    /// `[smallest, largest]`.
    pub fn overlaps(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
        largest_exclusive: bool,
    ) -> Vec<Arc<FileMetadata>> {
        self.levels[level]
            .iter()
            .filter(|f| f.overlaps_user_range(smallest, largest, largest_exclusive))
            .cloned()
            .collect()
    }

    fn with_edit(&self, edit: &VersionEdit) -> Self {
        let mut levels = self.levels.clone();
        for (level, file_num) in &edit.deleted_files {
            levels[*level].retain(|f| f.file_num != *file_num);
        }
        for (level, meta) in &edit.new_files {
            levels[*level].push(meta.clone());
        }
        // L0 newest-last by seqno; deeper levels sorted by smallest key.
        levels[0].sort_by_key(|f| (f.largest_seqno, f.file_num));
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
        Self { levels }
    }
}

/// In-memory version edit; serialized to a manifest record on publication.
#[derive(Default)]
pub struct VersionEdit {
    pub new_files: Vec<(usize, Arc<FileMetadata>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub min_unflushed_log_num: Option<u64>,
}

impl VersionEdit {
    fn to_record(&self) -> VersionEditRecord {
        VersionEditRecord {
            new_files: self
                .new_files
                .iter()
                .map(|(level, meta)| NewFileRecord {
                    level: *level,
                    meta: (**meta).clone(),
                })
                .collect(),
            deleted_files: self
                .deleted_files
                .iter()
                .map(|(level, file_num)| DeletedFileRecord {
                    level: *level,
                    file_num: *file_num,
                })
                .collect(),
            min_unflushed_log_num: self.min_unflushed_log_num,
        }
    }
}

/// Version set + manifest.
pub struct VersionSet {
    current: RwLock<Arc<Version>>,
    manifest: Mutex<Manifest>,
    /// Manifest edit lock: serializes target-level picking with version
    /// publication. Acquired via `log_lock`, released by `log_and_apply`.
    log_mu: Mutex<()>,
    next_file_num: AtomicU64,
    min_unflushed_log_num: AtomicU64,
    recovered_last_seqno: u64,
    objstore: ObjectStore,
    cache_id: u64,
    reader_cache: Mutex<LruCache<(u64, u64), Arc<TableReader>>>,
    obsolete: Mutex<Vec<u64>>,
    level_metrics: Mutex<BTreeMap<usize, LevelMetrics>>,
}

impl VersionSet {
    pub fn recover(dir: &Path, reader_cache_entries: usize) -> anyhow::Result<Self> {
        let (manifest, state) = Manifest::open(dir).context("open manifest")?;
        let objstore = ObjectStore::open(dir)?;

        let mut version = Version::empty();
        let mut max_file_num = 0u64;
        let mut max_seqno = 0u64;
        let mut metrics: BTreeMap<usize, LevelMetrics> = BTreeMap::new();
        for (level, files) in state.levels {
            for (file_num, meta) in files {
                max_file_num = max_file_num.max(file_num);
                max_seqno = max_seqno.max(meta.largest_seqno);
                let meta = Arc::new(meta);
                meta.refs.fetch_add(1, Ordering::SeqCst);
                let entry = metrics.entry(level).or_default();
                entry.file_count += 1;
                entry.bytes += meta.size;
                version.levels[level].push(meta);
            }
        }
        version.levels[0].sort_by_key(|f| (f.largest_seqno, f.file_num));
        for level in version.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }

        let cache_entries =
            NonZeroUsize::new(reader_cache_entries.max(1)).expect("non-zero cache size");
        Ok(Self {
            current: RwLock::new(Arc::new(version)),
            manifest: Mutex::new(manifest),
            log_mu: Mutex::new(()),
            next_file_num: AtomicU64::new(max_file_num.saturating_add(1).max(1)),
            min_unflushed_log_num: AtomicU64::new(state.min_unflushed_log_num),
            recovered_last_seqno: max_seqno,
            objstore,
            cache_id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            reader_cache: Mutex::new(LruCache::new(cache_entries)),
            obsolete: Mutex::new(Vec::new()),
            level_metrics: Mutex::new(metrics),
        })
    }

    pub fn objstore(&self) -> &ObjectStore {
        &self.objstore
    }

    pub fn current_version(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    pub fn next_file_num(&self) -> u64 {
        self.next_file_num.fetch_add(1, Ordering::SeqCst)
    }

    pub fn min_unflushed_log_num(&self) -> u64 {
        self.min_unflushed_log_num.load(Ordering::SeqCst)
    }

    pub fn last_seqno_hint(&self) -> u64 {
        self.recovered_last_seqno
    }

    pub fn level_metrics(&self) -> BTreeMap<usize, LevelMetrics> {
        self.level_metrics.lock().clone()
    }

    /// Acquires the manifest edit lock. The guard must be handed to
    /// `log_and_apply`, which releases it on both success and failure.
    pub fn log_lock(&self) -> MutexGuard<'_, ()> {
        self.log_mu.lock()
    }

    /// Persists `edit` to the manifest and installs the resulting version.
    /// Files deleted by the edit whose reference count drops to zero are
    /// queued for obsolete removal.
    pub fn log_and_apply(
        &self,
        guard: MutexGuard<'_, ()>,
        job_id: u64,
        edit: VersionEdit,
        metrics: BTreeMap<usize, LevelMetrics>,
    ) -> anyhow::Result<()> {
        let _guard = guard;
        {
            let mut manifest = self.manifest.lock();
            manifest
                .append(&ManifestRecord::VersionEdit(edit.to_record()), true)
                .with_context(|| format!("job {job_id}: append version edit"))?;
            manifest.sync_dir()?;
        }

        let current = self.current.read().clone();
        let next = current.with_edit(&edit);

        for (_, meta) in &edit.new_files {
            meta.refs.fetch_add(1, Ordering::SeqCst);
        }
        let mut dropped = Vec::new();
        for (level, file_num) in &edit.deleted_files {
            if let Some(meta) = current
                .files(*level)
                .iter()
                .find(|f| f.file_num == *file_num)
            {
                if meta.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
                    dropped.push(*file_num);
                }
            }
        }
        if !dropped.is_empty() {
            self.obsolete.lock().extend(dropped);
        }

        if let Some(log_num) = edit.min_unflushed_log_num {
            self.min_unflushed_log_num.fetch_max(log_num, Ordering::SeqCst);
        }

        {
            let mut level_metrics = self.level_metrics.lock();
            for (level, delta) in metrics {
                level_metrics.entry(level).or_default().merge(&delta);
            }
        }

        *self.current.write() = Arc::new(next);
        Ok(())
    }

    /// Queues a file for obsolete removal once its reference count reaches
    /// zero. Used by flushable retirement, which is not a version edit.
    pub fn unref_file(&self, meta: &FileMetadata) {
        if meta.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.obsolete.lock().push(meta.file_num);
        }
    }

    pub fn ref_file(&self, meta: &FileMetadata) {
        meta.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes queued obsolete objects; failures are logged and retried on
    /// the next sweep.
    pub fn remove_obsolete_files(&self) {
        let drained: Vec<u64> = std::mem::take(&mut *self.obsolete.lock());
        for file_num in drained {
            self.drop_cached_reader(file_num);
            if let Err(err) = self.objstore.remove(file_num) {
                tracing::warn!(file_num, error = %err, "failed to remove obsolete table");
                self.obsolete.lock().push(file_num);
            } else {
                tracing::info!(file_num, "removed obsolete table");
            }
        }
    }

    /// Removes table objects referenced by neither the current version nor
    /// `extra_referenced`. Only safe when no ingest or flush is in flight;
    /// called on open.
    pub fn sweep_orphans(&self, extra_referenced: &[u64]) -> anyhow::Result<usize> {
        let current = self.current_version();
        let mut referenced: std::collections::HashSet<u64> =
            current.all_files().map(|(_, f)| f.file_num).collect();
        referenced.extend(extra_referenced.iter().copied());

        let mut removed = 0usize;
        for file_num in self.objstore.list()? {
            if referenced.contains(&file_num) {
                continue;
            }
            self.objstore.remove(file_num)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn drop_cached_reader(&self, file_num: u64) {
        self.reader_cache.lock().pop(&(self.cache_id, file_num));
    }
}

impl ReaderProvider for VersionSet {
    fn reader(&self, meta: &FileMetadata) -> anyhow::Result<Arc<TableReader>> {
        let key = (self.cache_id, meta.file_num);
        if let Some(reader) = self.reader_cache.lock().get(&key) {
            return Ok(reader.clone());
        }
        let path = self.objstore.path_of(meta.file_num);
        let reader = Arc::new(
            TableReader::open_with_options(
                &path,
                ReaderOptions {
                    global_seqno: meta.global_seqno(),
                },
            )
            .with_context(|| format!("open table {}", path.display()))?,
        );
        self.reader_cache.lock().put(key, reader.clone());
        Ok(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_bounds(file_num: u64, smallest: &str, largest: &str) -> FileMetadata {
        let mut meta = FileMetadata::new(file_num, 100);
        meta.extend_point_key_bounds(
            InternalKey::new(Bytes::copy_from_slice(smallest.as_bytes()), 1, KeyKind::Set),
            InternalKey::new(Bytes::copy_from_slice(largest.as_bytes()), 1, KeyKind::Set),
        );
        meta.smallest_seqno = 1;
        meta.largest_seqno = 1;
        meta
    }

    #[test]
    fn base_level_tracks_shallowest_occupied() {
        let mut v = Version::empty();
        assert_eq!(v.base_level(), NUM_LEVELS - 1);
        v.levels[6].push(Arc::new(meta_with_bounds(1, "a", "b")));
        assert_eq!(v.base_level(), 5);
        v.levels[3].push(Arc::new(meta_with_bounds(2, "c", "d")));
        assert_eq!(v.base_level(), 2);
        v.levels[1].push(Arc::new(meta_with_bounds(3, "e", "f")));
        assert_eq!(v.base_level(), 1);
    }

    #[test]
    fn overall_bounds_are_category_min_max() {
        let mut meta = FileMetadata::new(1, 10);
        meta.extend_point_key_bounds(
            InternalKey::new(Bytes::from("d"), 0, KeyKind::Set),
            InternalKey::new(Bytes::from("m"), 0, KeyKind::Set),
        );
        meta.extend_range_key_bounds(
            InternalKey::new(Bytes::from("a"), 0, KeyKind::RangeKeySet),
            InternalKey::range_end_sentinel(Bytes::from("z"), KeyKind::RangeKeySet),
        );
        assert_eq!(meta.smallest.user_key.as_ref(), b"a");
        assert_eq!(meta.largest.user_key.as_ref(), b"z");
        assert!(meta.largest.is_exclusive_sentinel());
        meta.smallest_seqno = 0;
        meta.largest_seqno = 0;
        meta.validate().expect("consistent bounds");
    }

    #[test]
    fn sentinel_largest_excludes_its_user_key() {
        let mut meta = FileMetadata::new(1, 10);
        meta.extend_point_key_bounds(
            InternalKey::new(Bytes::from("a"), 0, KeyKind::Set),
            InternalKey::range_end_sentinel(Bytes::from("k"), KeyKind::RangeDelete),
        );
        assert!(meta.contains_user_key(b"a"));
        assert!(meta.contains_user_key(b"j"));
        assert!(!meta.contains_user_key(b"k"));
        assert!(!meta.overlaps_user_range(b"k", b"z", false));
        assert!(meta.overlaps_user_range(b"j", b"z", false));
    }
}
