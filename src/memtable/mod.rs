//! In-memory write buffer and the flushable queue.
//!
//! The queue is ordered oldest to newest; the last entry wraps the mutable
//! memtable. Older entries are immutable and await flush. An entry may also
//! wrap a set of ingested tables spliced above the memtables
//! ("ingest-as-flushable").

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::db::{Op, OpKind};
use crate::internal_key::{InternalKey, KeyKind, Span};
use crate::iterator::{
    LevelPointIter, LevelSpanIter, PointIterator, ReaderProvider, SpanIterator, SpanKind,
    SpanVecIter,
};
use crate::sst::TableReader;
use crate::version::FileMetadata;

#[derive(Debug, Default)]
pub struct MemTable {
    points: SkipMap<InternalKey, Bytes>,
    range_dels: RwLock<Vec<Span>>,
    range_keys: RwLock<Vec<Span>>,
    approximate_bytes: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
            && self.range_dels.read().is_empty()
            && self.range_keys.read().is_empty()
    }

    /// Applies a batch; op `i` is stamped `seqno_base + i`.
    pub fn apply(&self, seqno_base: u64, ops: &[Op]) {
        for (i, op) in ops.iter().enumerate() {
            let seqno = seqno_base + i as u64;
            let bytes = (op.key.len() + op.value.len() + 16) as u64;
            match op.kind {
                OpKind::Set => {
                    self.points.insert(
                        InternalKey::new(op.key.clone(), seqno, KeyKind::Set),
                        op.value.clone(),
                    );
                }
                OpKind::Delete => {
                    self.points.insert(
                        InternalKey::new(op.key.clone(), seqno, KeyKind::Delete),
                        Bytes::new(),
                    );
                }
                OpKind::RangeDelete => {
                    let span = Span::new(
                        InternalKey::new(op.key.clone(), seqno, KeyKind::RangeDelete),
                        op.value.clone(),
                    );
                    insert_span(&mut self.range_dels.write(), span);
                }
                OpKind::RangeKeySet => {
                    let span = Span::new(
                        InternalKey::new(op.key.clone(), seqno, KeyKind::RangeKeySet),
                        op.value.clone(),
                    );
                    insert_span(&mut self.range_keys.write(), span);
                }
            }
            self.approximate_bytes
                .fetch_add(bytes, AtomicOrdering::Relaxed);
        }
    }

    /// Returns:
    /// - `None` if the key is not present
    /// - `Some((seqno, None))` if the newest visible entry is a tombstone
    /// - `Some((seqno, Some(value)))` otherwise
    pub fn get(&self, key: &[u8], snapshot_seqno: u64) -> Option<(u64, Option<Bytes>)> {
        let bound = InternalKey::search_bound(Bytes::copy_from_slice(key));
        let mut candidate: Option<(u64, Option<Bytes>)> = None;
        for entry in self.points.range((Bound::Included(bound), Bound::Unbounded)) {
            let k = entry.key();
            if k.user_key.as_ref() != key {
                break;
            }
            if k.seqno > snapshot_seqno {
                continue;
            }
            candidate = Some(match k.kind {
                KeyKind::Set => (k.seqno, Some(entry.value().clone())),
                _ => (k.seqno, None),
            });
            break;
        }

        let tombstone_seq = self
            .range_dels
            .read()
            .iter()
            .filter(|s| s.contains(key) && s.start.seqno <= snapshot_seqno)
            .map(|s| s.start.seqno)
            .max();

        match (candidate, tombstone_seq) {
            (Some((seq, value)), Some(tseq)) => {
                if tseq >= seq {
                    Some((tseq, None))
                } else {
                    Some((seq, value))
                }
            }
            (Some(found), None) => Some(found),
            (None, Some(tseq)) => Some((tseq, None)),
            (None, None) => None,
        }
    }

    pub fn point_iter(&self) -> MemPointIter<'_> {
        MemPointIter {
            points: &self.points,
            current: None,
        }
    }

    pub fn range_del_iter(&self) -> Option<SpanVecIter> {
        let spans = self.range_dels.read();
        if spans.is_empty() {
            return None;
        }
        Some(SpanVecIter::new(spans.clone()))
    }

    pub fn range_key_iter(&self) -> Option<SpanVecIter> {
        let spans = self.range_keys.read();
        if spans.is_empty() {
            return None;
        }
        Some(SpanVecIter::new(spans.clone()))
    }

    /// Sorted point entries, for flushing.
    pub fn entries(&self) -> Vec<(InternalKey, Bytes)> {
        self.points
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn range_del_spans(&self) -> Vec<Span> {
        self.range_dels.read().clone()
    }

    pub fn range_key_spans(&self) -> Vec<Span> {
        self.range_keys.read().clone()
    }
}

// Spans in a memtable are not re-fragmented; they stay sorted by start key
// so that forward scans can stop at the first span past a bound.
fn insert_span(spans: &mut Vec<Span>, span: Span) {
    let idx = spans.partition_point(|s| s.start.user_key <= span.start.user_key);
    spans.insert(idx, span);
}

pub struct MemPointIter<'a> {
    points: &'a SkipMap<InternalKey, Bytes>,
    current: Option<InternalKey>,
}

impl PointIterator for MemPointIter<'_> {
    fn seek_ge(&mut self, user_key: &[u8]) -> Option<InternalKey> {
        let bound = InternalKey::search_bound(Bytes::copy_from_slice(user_key));
        self.current = self
            .points
            .lower_bound(Bound::Included(&bound))
            .map(|e| e.key().clone());
        self.current.clone()
    }

    fn first(&mut self) -> Option<InternalKey> {
        self.current = self.points.front().map(|e| e.key().clone());
        self.current.clone()
    }

    fn last(&mut self) -> Option<InternalKey> {
        self.current = self.points.back().map(|e| e.key().clone());
        self.current.clone()
    }

    fn next(&mut self) -> Option<InternalKey> {
        let cur = self.current.take()?;
        self.current = self
            .points
            .lower_bound(Bound::Excluded(&cur))
            .map(|e| e.key().clone());
        self.current.clone()
    }
}

/// A set of ingested tables installed in the flushable queue. The files are
/// already linked into the object store and sequence-stamped; readers are
/// opened eagerly so lookups and overlap probes need no further I/O setup.
pub struct IngestedFlushable {
    files: Vec<Arc<FileMetadata>>,
    readers: Vec<Arc<TableReader>>,
}

impl IngestedFlushable {
    pub fn new(files: Vec<Arc<FileMetadata>>, readers: Vec<Arc<TableReader>>) -> Self {
        debug_assert_eq!(files.len(), readers.len());
        Self { files, readers }
    }

    pub fn files(&self) -> &[Arc<FileMetadata>] {
        &self.files
    }

    pub fn file_nums(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.file_num).collect()
    }

    fn reader_of(&self, file_num: u64) -> Option<Arc<TableReader>> {
        self.files
            .iter()
            .position(|f| f.file_num == file_num)
            .map(|i| self.readers[i].clone())
    }

    pub fn get(&self, key: &[u8], snapshot_seqno: u64) -> Option<(u64, Option<Bytes>)> {
        let mut best: Option<(u64, Option<Bytes>)> = None;
        for (meta, reader) in self.files.iter().zip(&self.readers) {
            if key < meta.smallest.user_key.as_ref() || key > meta.largest.user_key.as_ref() {
                continue;
            }
            let found = reader.get(key, snapshot_seqno).ok().flatten();
            let tombstone = reader
                .range_del_spans()
                .iter()
                .filter(|s| s.contains(key) && s.start.seqno <= snapshot_seqno)
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
            if let Some((seq, value)) = merged {
                match &best {
                    Some((best_seq, _)) if *best_seq >= seq => {}
                    _ => best = Some((seq, value)),
                }
            }
        }
        best
    }
}

impl ReaderProvider for IngestedFlushable {
    fn reader(&self, meta: &FileMetadata) -> anyhow::Result<Arc<TableReader>> {
        self.reader_of(meta.file_num)
            .ok_or_else(|| anyhow::anyhow!("no reader for ingested file {}", meta.file_num))
    }
}

/// Anything installable into the flushable queue.
pub enum Flushable {
    Mem(Arc<MemTable>),
    Ingested(Arc<IngestedFlushable>),
}

impl Flushable {
    pub fn is_empty(&self) -> bool {
        match self {
            Flushable::Mem(m) => m.is_empty(),
            Flushable::Ingested(f) => f.files.is_empty(),
        }
    }

    pub fn approximate_bytes(&self) -> u64 {
        match self {
            Flushable::Mem(m) => m.approximate_bytes(),
            Flushable::Ingested(f) => f.files.iter().map(|m| m.size).sum(),
        }
    }

    pub fn get(&self, key: &[u8], snapshot_seqno: u64) -> Option<(u64, Option<Bytes>)> {
        match self {
            Flushable::Mem(m) => m.get(key, snapshot_seqno),
            Flushable::Ingested(f) => f.get(key, snapshot_seqno),
        }
    }

    pub fn point_iter(&self) -> Box<dyn PointIterator + '_> {
        match self {
            Flushable::Mem(m) => Box::new(m.point_iter()),
            Flushable::Ingested(f) => Box::new(LevelPointIter::new(&**f, &f.files)),
        }
    }

    pub fn range_del_iter(&self) -> Option<Box<dyn SpanIterator + '_>> {
        match self {
            Flushable::Mem(m) => m
                .range_del_iter()
                .map(|it| Box::new(it) as Box<dyn SpanIterator>),
            Flushable::Ingested(f) => {
                Some(Box::new(LevelSpanIter::new(&**f, &f.files, SpanKind::RangeDel)))
            }
        }
    }

    pub fn range_key_iter(&self) -> Option<Box<dyn SpanIterator + '_>> {
        match self {
            Flushable::Mem(m) => m
                .range_key_iter()
                .map(|it| Box::new(it) as Box<dyn SpanIterator>),
            Flushable::Ingested(f) => {
                Some(Box::new(LevelSpanIter::new(&**f, &f.files, SpanKind::RangeKey)))
            }
        }
    }
}

/// Completion signal for a queue entry's flush.
#[derive(Default)]
pub struct FlushDone {
    done: Mutex<bool>,
    cv: Condvar,
}

impl FlushDone {
    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// One entry in the flushable queue.
pub struct FlushableEntry {
    pub flushable: Flushable,
    /// WAL segment receiving this flushable's records.
    pub log_num: u64,
    pub flush_forced: AtomicBool,
    pub flushed: Arc<FlushDone>,
}

impl FlushableEntry {
    pub fn new(flushable: Flushable, log_num: u64) -> Arc<Self> {
        Arc::new(Self {
            flushable,
            log_num,
            flush_forced: AtomicBool::new(false),
            flushed: Arc::new(FlushDone::default()),
        })
    }

    pub fn force_flush(&self) {
        self.flush_forced.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_flush_forced(&self) -> bool {
        self.flush_forced.load(AtomicOrdering::SeqCst)
    }
}
