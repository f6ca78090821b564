use std::sync::Arc;

use crate::event::{EventListener, NoopListener};
use crate::sst::{TABLE_FORMAT_V1, TABLE_FORMAT_V2};

/// Ratcheting on-disk feature gate. Each version bounds the table formats
/// the database will open; `FlushableIngest` additionally allows splicing
/// an ingest into the flushable queue instead of forcing a memtable flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatMajorVersion {
    Base,
    FlushableIngest,
}

impl FormatMajorVersion {
    pub fn min_table_format(self) -> u32 {
        TABLE_FORMAT_V1
    }

    pub fn max_table_format(self) -> u32 {
        match self {
            FormatMajorVersion::Base => TABLE_FORMAT_V1,
            FormatMajorVersion::FlushableIngest => TABLE_FORMAT_V2,
        }
    }
}

#[derive(Clone)]
pub struct DbOptions {
    pub block_size: usize,
    pub memtable_bytes: u64,
    /// Queue length at which an overlapping ingest forces a flush instead
    /// of splicing in as a flushable.
    pub memtable_stop_writes_threshold: usize,
    pub format_major_version: FormatMajorVersion,
    pub disable_ingest_as_flushable: bool,
    pub validate_on_ingest: bool,
    pub read_only: bool,
    pub disable_wal: bool,
    pub sync_writes: bool,
    pub reader_cache_entries: usize,
    pub event_listener: Arc<dyn EventListener>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            memtable_bytes: 4 * 1024 * 1024,
            memtable_stop_writes_threshold: 4,
            format_major_version: FormatMajorVersion::FlushableIngest,
            disable_ingest_as_flushable: false,
            validate_on_ingest: false,
            read_only: false,
            disable_wal: false,
            sync_writes: true,
            reader_cache_entries: 64,
            event_listener: Arc::new(NoopListener),
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("block_size", &self.block_size)
            .field("memtable_bytes", &self.memtable_bytes)
            .field(
                "memtable_stop_writes_threshold",
                &self.memtable_stop_writes_threshold,
            )
            .field("format_major_version", &self.format_major_version)
            .field(
                "disable_ingest_as_flushable",
                &self.disable_ingest_as_flushable,
            )
            .field("validate_on_ingest", &self.validate_on_ingest)
            .field("read_only", &self.read_only)
            .field("disable_wal", &self.disable_wal)
            .field("sync_writes", &self.sync_writes)
            .field("reader_cache_entries", &self.reader_cache_entries)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Read at this sequence number instead of the latest visible one.
    pub snapshot_seqno: Option<u64>,
}
