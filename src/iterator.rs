//! Iterator traits shared by memtables, single tables, and level spans.
//!
//! Point iterators yield internal keys; span iterators yield
//! `(start_internal_key, end_user_key_exclusive)` spans. Both are lazy
//! finite sequences with a uniform surface: `seek_ge`/`seek_lt`, `first`,
//! `last`, `next`, and `error`. A failed read parks the error on the
//! iterator; overlap probes treat an errored iterator as overlapping.

use std::sync::Arc;

use bytes::Bytes;

use crate::internal_key::{InternalKey, Span};
use crate::sst::TableReader;
use crate::version::FileMetadata;

/// Source of open table readers for level-spanning iterators. Implemented
/// by the version set (cached readers) and by ingested flushables (readers
/// opened at splice time).
pub trait ReaderProvider {
    fn reader(&self, meta: &FileMetadata) -> anyhow::Result<Arc<TableReader>>;
}

pub trait PointIterator {
    /// First key with `user_key >=` the target, in internal-key order.
    /// Level-spanning implementations may return a synthetic boundary key
    /// (the file's largest bound) when a file holds only span data past the
    /// target.
    fn seek_ge(&mut self, user_key: &[u8]) -> Option<InternalKey>;
    fn first(&mut self) -> Option<InternalKey>;
    fn last(&mut self) -> Option<InternalKey>;
    fn next(&mut self) -> Option<InternalKey>;
    fn error(&self) -> Option<&anyhow::Error> {
        None
    }
}

pub trait SpanIterator {
    /// Largest span whose start user key is `<` the target. Positions the
    /// cursor so that `next` continues forward; when no such span exists the
    /// cursor rewinds before the first span.
    fn seek_lt(&mut self, user_key: &[u8]) -> Option<Span>;
    fn first(&mut self) -> Option<Span>;
    fn next(&mut self) -> Option<Span>;
    fn error(&self) -> Option<&anyhow::Error> {
        None
    }
}

/// Span iterator over an owned, sorted, fragmented span list.
pub struct SpanVecIter {
    spans: Vec<Span>,
    // None = before the first span.
    pos: Option<usize>,
}

impl SpanVecIter {
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans, pos: None }
    }

    fn at(&self, pos: usize) -> Option<Span> {
        self.spans.get(pos).cloned()
    }
}

impl SpanIterator for SpanVecIter {
    fn seek_lt(&mut self, user_key: &[u8]) -> Option<Span> {
        let idx = self
            .spans
            .partition_point(|s| s.start.user_key.as_ref() < user_key);
        if idx == 0 {
            self.pos = None;
            return None;
        }
        self.pos = Some(idx - 1);
        self.at(idx - 1)
    }

    fn first(&mut self) -> Option<Span> {
        self.pos = Some(0);
        self.at(0)
    }

    fn next(&mut self) -> Option<Span> {
        let next = match self.pos {
            None => 0,
            Some(p) => p.saturating_add(1),
        };
        self.pos = Some(next);
        self.at(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    RangeDel,
    RangeKey,
}

struct FileCursor {
    reader: Arc<crate::sst::TableReader>,
    block_idx: usize,
    entries: Vec<(InternalKey, Bytes)>,
    entry_pos: usize,
}

/// Point iterator spanning one level's files (sorted, non-overlapping).
/// When a file holds no point key at or past the seek target but does hold
/// spans, the file's largest bound is surfaced as a synthetic boundary key
/// so that bounds comparisons against it remain meaningful.
pub struct LevelPointIter<'a> {
    provider: &'a dyn ReaderProvider,
    files: &'a [Arc<FileMetadata>],
    file_idx: usize,
    cursor: Option<FileCursor>,
    err: Option<anyhow::Error>,
}

impl<'a> LevelPointIter<'a> {
    pub fn new(provider: &'a dyn ReaderProvider, files: &'a [Arc<FileMetadata>]) -> Self {
        Self {
            provider,
            files,
            file_idx: 0,
            cursor: None,
            err: None,
        }
    }

    fn open(&mut self, file_idx: usize) -> Option<Arc<crate::sst::TableReader>> {
        match self.provider.reader(&self.files[file_idx]) {
            Ok(reader) => Some(reader),
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }

    fn load_block(&mut self, reader: Arc<crate::sst::TableReader>, block_idx: usize) -> bool {
        match reader.read_block_at(block_idx) {
            Ok(entries) => {
                self.cursor = Some(FileCursor {
                    reader,
                    block_idx,
                    entries,
                    entry_pos: 0,
                });
                true
            }
            Err(e) => {
                self.err = Some(e.into());
                self.cursor = None;
                false
            }
        }
    }

    fn current(&self) -> Option<InternalKey> {
        let cursor = self.cursor.as_ref()?;
        cursor.entries.get(cursor.entry_pos).map(|(k, _)| k.clone())
    }

    /// First point key of files starting at `self.file_idx`, emitting the
    /// span-only boundary of a pointless file as it passes.
    fn first_point_from_current_file(&mut self) -> Option<InternalKey> {
        while self.file_idx < self.files.len() {
            let reader = self.open(self.file_idx)?;
            if reader.block_count() > 0 {
                if !self.load_block(reader, 0) {
                    return None;
                }
                return self.current();
            }
            if !reader.range_del_spans().is_empty() || !reader.range_key_spans().is_empty() {
                let boundary = self.files[self.file_idx].largest.clone();
                self.file_idx += 1;
                self.cursor = None;
                return Some(boundary);
            }
            self.file_idx += 1;
        }
        None
    }
}

impl PointIterator for LevelPointIter<'_> {
    fn seek_ge(&mut self, user_key: &[u8]) -> Option<InternalKey> {
        self.cursor = None;
        self.file_idx = self
            .files
            .partition_point(|f| f.largest.user_key.as_ref() < user_key);
        let target = InternalKey::search_bound(Bytes::copy_from_slice(user_key));
        while self.file_idx < self.files.len() {
            let reader = self.open(self.file_idx)?;
            let mut block_idx = reader.find_block(&target);
            while block_idx < reader.block_count() {
                if !self.load_block(reader.clone(), block_idx) {
                    return None;
                }
                let cursor = self.cursor.as_mut().expect("cursor loaded");
                cursor.entry_pos = cursor.entries.partition_point(|(k, _)| *k < target);
                if cursor.entry_pos < cursor.entries.len() {
                    return self.current();
                }
                block_idx += 1;
            }
            // No point at or past the target in this file. If the file
            // carries spans its largest bound still constrains overlap, so
            // surface it as a synthetic boundary.
            if !reader.range_del_spans().is_empty() || !reader.range_key_spans().is_empty() {
                let boundary = self.files[self.file_idx].largest.clone();
                self.file_idx += 1;
                self.cursor = None;
                return Some(boundary);
            }
            self.file_idx += 1;
        }
        None
    }

    fn first(&mut self) -> Option<InternalKey> {
        self.cursor = None;
        self.file_idx = 0;
        self.first_point_from_current_file()
    }

    fn last(&mut self) -> Option<InternalKey> {
        self.cursor = None;
        for file_idx in (0..self.files.len()).rev() {
            self.file_idx = file_idx;
            let reader = self.open(file_idx)?;
            let blocks = reader.block_count();
            if blocks == 0 {
                continue;
            }
            if !self.load_block(reader, blocks - 1) {
                return None;
            }
            let cursor = self.cursor.as_mut().expect("cursor loaded");
            cursor.entry_pos = cursor.entries.len().saturating_sub(1);
            return self.current();
        }
        None
    }

    fn next(&mut self) -> Option<InternalKey> {
        enum Step {
            NoCursor,
            Advanced,
            NextBlock(Arc<crate::sst::TableReader>, usize),
            FileExhausted,
        }
        loop {
            let step = match self.cursor.as_mut() {
                // Past a synthetic boundary, or never positioned: continue
                // with the next file's points.
                None => Step::NoCursor,
                Some(cursor) => {
                    if cursor.entry_pos + 1 < cursor.entries.len() {
                        cursor.entry_pos += 1;
                        Step::Advanced
                    } else if cursor.block_idx + 1 < cursor.reader.block_count() {
                        Step::NextBlock(cursor.reader.clone(), cursor.block_idx + 1)
                    } else {
                        Step::FileExhausted
                    }
                }
            };
            match step {
                Step::NoCursor => return self.first_point_from_current_file(),
                Step::Advanced => return self.current(),
                Step::NextBlock(reader, block_idx) => {
                    if !self.load_block(reader, block_idx) {
                        return None;
                    }
                    if self.cursor.as_ref().is_some_and(|c| !c.entries.is_empty()) {
                        return self.current();
                    }
                }
                Step::FileExhausted => {
                    self.cursor = None;
                    self.file_idx += 1;
                }
            }
        }
    }

    fn error(&self) -> Option<&anyhow::Error> {
        self.err.as_ref()
    }
}

/// Span iterator spanning one level's files.
pub struct LevelSpanIter<'a> {
    provider: &'a dyn ReaderProvider,
    files: &'a [Arc<FileMetadata>],
    kind: SpanKind,
    // None = before the first span of the level.
    pos: Option<(usize, usize)>,
    err: Option<anyhow::Error>,
}

impl<'a> LevelSpanIter<'a> {
    pub fn new(
        provider: &'a dyn ReaderProvider,
        files: &'a [Arc<FileMetadata>],
        kind: SpanKind,
    ) -> Self {
        Self {
            provider,
            files,
            kind,
            pos: None,
            err: None,
        }
    }

    fn spans_of(&mut self, file_idx: usize) -> Option<Vec<Span>> {
        match self.provider.reader(&self.files[file_idx]) {
            Ok(reader) => Some(match self.kind {
                SpanKind::RangeDel => reader.range_del_spans().to_vec(),
                SpanKind::RangeKey => reader.range_key_spans().to_vec(),
            }),
            Err(e) => {
                self.err = Some(e);
                None
            }
        }
    }
}

impl SpanIterator for LevelSpanIter<'_> {
    fn seek_lt(&mut self, user_key: &[u8]) -> Option<Span> {
        for file_idx in (0..self.files.len()).rev() {
            if self.files[file_idx].smallest.user_key.as_ref() >= user_key {
                continue;
            }
            let spans = self.spans_of(file_idx)?;
            let idx = spans.partition_point(|s| s.start.user_key.as_ref() < user_key);
            if idx > 0 {
                self.pos = Some((file_idx, idx - 1));
                return Some(spans[idx - 1].clone());
            }
        }
        self.pos = None;
        None
    }

    fn first(&mut self) -> Option<Span> {
        for file_idx in 0..self.files.len() {
            let spans = self.spans_of(file_idx)?;
            if !spans.is_empty() {
                self.pos = Some((file_idx, 0));
                return Some(spans[0].clone());
            }
        }
        self.pos = Some((self.files.len(), 0));
        None
    }

    fn next(&mut self) -> Option<Span> {
        let (mut file_idx, mut span_idx) = match self.pos {
            None => return self.first(),
            Some((f, s)) => (f, s + 1),
        };
        while file_idx < self.files.len() {
            let spans = self.spans_of(file_idx)?;
            if span_idx < spans.len() {
                self.pos = Some((file_idx, span_idx));
                return Some(spans[span_idx].clone());
            }
            file_idx += 1;
            span_idx = 0;
        }
        self.pos = Some((file_idx, 0));
        None
    }

    fn error(&self) -> Option<&anyhow::Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal_key::KeyKind;

    fn span(start: &str, end: &str) -> Span {
        Span::new(
            InternalKey::new(Bytes::copy_from_slice(start.as_bytes()), 1, KeyKind::RangeDelete),
            Bytes::copy_from_slice(end.as_bytes()),
        )
    }

    #[test]
    fn span_vec_iter_seek_lt() {
        let mut it = SpanVecIter::new(vec![span("b", "c"), span("f", "h"), span("m", "p")]);
        let got = it.seek_lt(b"g").expect("span before g");
        assert_eq!(got.start.user_key.as_ref(), b"f");
        let next = it.next().expect("following span");
        assert_eq!(next.start.user_key.as_ref(), b"m");
        assert!(it.next().is_none());
    }

    #[test]
    fn span_vec_iter_seek_lt_before_first_rewinds() {
        let mut it = SpanVecIter::new(vec![span("f", "h")]);
        assert!(it.seek_lt(b"a").is_none());
        let first = it.next().expect("first span after rewind");
        assert_eq!(first.start.user_key.as_ref(), b"f");
    }

    #[test]
    fn span_vec_iter_empty() {
        let mut it = SpanVecIter::new(Vec::new());
        assert!(it.seek_lt(b"a").is_none());
        assert!(it.next().is_none());
        assert!(it.first().is_none());
    }
}
