use bytes::Bytes;

use crate::internal_key::InternalKey;
use crate::iterator::PointIterator;

use super::TableReader;

/// Cursor over one table's point keys. Block-at-a-time; decoded entries
/// already carry the reader's global seqno substitution.
pub struct TablePointIter<'a> {
    reader: &'a TableReader,
    block_idx: usize,
    entries: Vec<(InternalKey, Bytes)>,
    entry_pos: usize,
    err: Option<anyhow::Error>,
}

impl<'a> TablePointIter<'a> {
    pub(super) fn new(reader: &'a TableReader) -> Self {
        Self {
            reader,
            block_idx: 0,
            entries: Vec::new(),
            entry_pos: 0,
            err: None,
        }
    }

    fn load_block(&mut self, block_idx: usize) -> bool {
        if block_idx >= self.reader.block_count() {
            self.entries.clear();
            return false;
        }
        match self.reader.read_block_at(block_idx) {
            Ok(entries) => {
                self.block_idx = block_idx;
                self.entries = entries;
                self.entry_pos = 0;
                true
            }
            Err(e) => {
                self.err = Some(e.into());
                self.entries.clear();
                false
            }
        }
    }

    fn current(&self) -> Option<InternalKey> {
        self.entries.get(self.entry_pos).map(|(k, _)| k.clone())
    }
}

impl PointIterator for TablePointIter<'_> {
    fn seek_ge(&mut self, user_key: &[u8]) -> Option<InternalKey> {
        let target = InternalKey::search_bound(Bytes::copy_from_slice(user_key));
        let mut block_idx = self.reader.find_block(&target);
        loop {
            if !self.load_block(block_idx) {
                return None;
            }
            self.entry_pos = self.entries.partition_point(|(k, _)| *k < target);
            if self.entry_pos < self.entries.len() {
                return self.current();
            }
            block_idx += 1;
        }
    }

    fn first(&mut self) -> Option<InternalKey> {
        if !self.load_block(0) {
            return None;
        }
        self.current()
    }

    fn last(&mut self) -> Option<InternalKey> {
        let blocks = self.reader.block_count();
        if blocks == 0 || !self.load_block(blocks - 1) {
            return None;
        }
        self.entry_pos = self.entries.len().saturating_sub(1);
        self.current()
    }

    fn next(&mut self) -> Option<InternalKey> {
        loop {
            if self.entry_pos + 1 < self.entries.len() {
                self.entry_pos += 1;
                return self.current();
            }
            let next_block = self.block_idx + 1;
            if self.entries.is_empty() || next_block >= self.reader.block_count() {
                return None;
            }
            if !self.load_block(next_block) {
                return None;
            }
            if !self.entries.is_empty() {
                return self.current();
            }
        }
    }

    fn error(&self) -> Option<&anyhow::Error> {
        self.err.as_ref()
    }
}
