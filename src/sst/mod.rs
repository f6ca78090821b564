//! SSTable (Sorted String Table) format.
//!
//! Goals:
//! - Simple on-disk format with verifiable checksums.
//! - Point lookups via index + binary search within blocks.
//! - Raw access to range-deletion and range-key spans for overlap probes.
//!
//! File layout:
//! ```text
//! [data blocks...]
//! [range-del block]
//! [range-key block]
//! [index block]
//! [properties block]
//! [footer][footer_len][MAGIC]
//! ```
//!
//! Data block format:
//! ```text
//! [count u32]
//! repeated count times:
//!   [internal_key]
//!   [val_len u32][val bytes]
//! [trailer]
//! ```
//!
//! Trailer format:
//! - crc32c(u32) over block payload (everything before trailer)
//! - blake3(32 bytes) over block payload
//!
//! Span, index, and properties blocks are bincode payloads followed by a
//! crc32c(u32). Index block entries map
//! `last_internal_key_in_block -> {offset,len}`.
//!
//! Table format v1 holds point keys only; v2 adds the span blocks. External
//! producers write every key with `seqno == 0`; a reader opened with a
//! global sequence number substitutes it for zero seqnos on decode.

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::internal_key::{InternalKey, KeyKind, Span};

mod iter;

pub use iter::TablePointIter;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] crate::internal_key::DecodeError),

    #[error("table corrupt: {0}")]
    Corrupt(&'static str),
}

/// Point-key-only layout.
pub const TABLE_FORMAT_V1: u32 = 1;
/// Adds range-deletion and range-key span blocks.
pub const TABLE_FORMAT_V2: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRoot(pub [u8; 32]);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProperties {
    pub entries: u64,
    pub range_del_count: u64,
    pub range_key_count: u64,
    pub data_bytes: u64,
    /// Encoded bytes of point deletion entries; descriptor statistic.
    pub point_del_bytes: u64,
    /// Encoded bytes of range-deletion spans; descriptor statistic.
    pub range_del_bytes: u64,
    pub table_format: u32,
    pub table_root: TableRoot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockHandle {
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    last_key: InternalKey,
    handle: BlockHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Footer {
    table_format: u32,
    range_del_handle: BlockHandle,
    range_key_handle: BlockHandle,
    index_handle: BlockHandle,
    props_handle: BlockHandle,
    table_root: TableRoot,
}

const MAGIC: &[u8; 8] = b"GRAFTDB1";
const BLOCK_TRAILER_SIZE: usize = 4 + 32;

pub struct TableBuilder {
    format: u32,
    block_size: usize,
    file: std::fs::File,
    path_tmp: PathBuf,
    path_final: PathBuf,
    buf: Vec<u8>,
    entries_in_block: u32,
    last_key: Option<InternalKey>,
    index: Vec<IndexEntry>,
    range_dels: Vec<Span>,
    range_keys: Vec<Span>,
    entries: u64,
    data_bytes: u64,
    point_del_bytes: u64,
    range_del_bytes: u64,
    table_hasher: blake3::Hasher,
}

impl TableBuilder {
    pub fn create(
        dir: &Path,
        file_num: u64,
        block_size: usize,
        format: u32,
    ) -> Result<Self, TableError> {
        std::fs::create_dir_all(dir)?;
        let path_tmp = dir.join(format!("sst_{file_num:016x}.tmp"));
        let path_final = dir.join(format!("sst_{file_num:016x}.sst"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path_tmp)?;
        Ok(Self {
            format,
            block_size,
            file,
            path_tmp,
            path_final,
            buf: Vec::with_capacity(block_size + 256),
            entries_in_block: 0,
            last_key: None,
            index: Vec::new(),
            range_dels: Vec::new(),
            range_keys: Vec::new(),
            entries: 0,
            data_bytes: 0,
            point_del_bytes: 0,
            range_del_bytes: 0,
            table_hasher: blake3::Hasher::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path_final
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<(), TableError> {
        if let Some(last) = &self.last_key {
            if key < last {
                return Err(TableError::Corrupt(
                    "internal keys must be added in sorted order",
                ));
            }
        }
        self.last_key = Some(key.clone());
        self.entries += 1;

        if self.entries_in_block == 0 {
            self.buf.extend_from_slice(&0u32.to_le_bytes());
        }
        let before = self.buf.len();
        key.encode_into(&mut self.buf);
        let val_len: u32 = value
            .len()
            .try_into()
            .map_err(|_| TableError::Corrupt("value too large"))?;
        self.buf.extend_from_slice(&val_len.to_le_bytes());
        self.buf.extend_from_slice(value);
        if key.kind == KeyKind::Delete {
            self.point_del_bytes += (self.buf.len() - before) as u64;
        }
        self.entries_in_block += 1;
        self.buf[0..4].copy_from_slice(&self.entries_in_block.to_le_bytes());

        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn add_range_del(&mut self, span: Span) -> Result<(), TableError> {
        self.push_span(span, true)
    }

    pub fn add_range_key(&mut self, span: Span) -> Result<(), TableError> {
        self.push_span(span, false)
    }

    fn push_span(&mut self, span: Span, deletion: bool) -> Result<(), TableError> {
        if self.format < TABLE_FORMAT_V2 {
            return Err(TableError::Corrupt("table format does not support spans"));
        }
        if span.is_empty() {
            return Err(TableError::Corrupt("empty span"));
        }
        let spans = if deletion {
            &mut self.range_dels
        } else {
            &mut self.range_keys
        };
        if let Some(prev) = spans.last() {
            if span.start.user_key.as_ref() < prev.end.as_ref() {
                return Err(TableError::Corrupt(
                    "spans must be fragmented and added in order",
                ));
            }
        }
        if deletion {
            self.range_del_bytes += (span.start.user_key.len() + span.end.len() + 9) as u64;
        }
        spans.push(span);
        Ok(())
    }

    pub fn finish(mut self) -> Result<TableProperties, TableError> {
        if self.entries_in_block > 0 {
            self.flush_block()?;
        }

        let range_dels = std::mem::take(&mut self.range_dels);
        let range_keys = std::mem::take(&mut self.range_keys);
        let range_del_handle = self.write_span_block(&range_dels)?;
        let range_key_handle = self.write_span_block(&range_keys)?;

        let index_offset = self.file.stream_position()?;
        let index_bytes =
            bincode::serialize(&self.index).map_err(|_| TableError::Corrupt("index serialize"))?;
        self.table_hasher.update(&index_bytes);
        let index_handle = self.write_checked(index_offset, &index_bytes)?;

        let table_root = TableRoot(*self.table_hasher.finalize().as_bytes());
        let props = TableProperties {
            entries: self.entries,
            range_del_count: range_dels.len() as u64,
            range_key_count: range_keys.len() as u64,
            data_bytes: self.data_bytes,
            point_del_bytes: self.point_del_bytes,
            range_del_bytes: self.range_del_bytes,
            table_format: self.format,
            table_root,
        };
        let props_offset = self.file.stream_position()?;
        let props_bytes =
            bincode::serialize(&props).map_err(|_| TableError::Corrupt("props serialize"))?;
        let props_handle = self.write_checked(props_offset, &props_bytes)?;

        let footer = Footer {
            table_format: self.format,
            range_del_handle,
            range_key_handle,
            index_handle,
            props_handle,
            table_root,
        };
        let footer_bytes =
            bincode::serialize(&footer).map_err(|_| TableError::Corrupt("footer serialize"))?;
        let footer_len: u32 = footer_bytes
            .len()
            .try_into()
            .map_err(|_| TableError::Corrupt("footer too large"))?;
        self.file.write_all(&footer_bytes)?;
        self.file.write_all(&footer_len.to_le_bytes())?;
        self.file.write_all(MAGIC)?;
        self.file.sync_data()?;
        drop(self.file);

        std::fs::rename(&self.path_tmp, &self.path_final)?;
        fsync_parent_dir(&self.path_final)?;
        Ok(props)
    }

    fn write_span_block(&mut self, spans: &[Span]) -> Result<BlockHandle, TableError> {
        let offset = self.file.stream_position()?;
        let bytes = bincode::serialize(spans).map_err(|_| TableError::Corrupt("span serialize"))?;
        self.table_hasher.update(&bytes);
        self.write_checked(offset, &bytes)
    }

    fn write_checked(&mut self, offset: u64, payload: &[u8]) -> Result<BlockHandle, TableError> {
        let crc = crc32c::crc32c(payload);
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        let len: u32 = (payload.len() + 4)
            .try_into()
            .map_err(|_| TableError::Corrupt("block too large"))?;
        Ok(BlockHandle { offset, len })
    }

    fn flush_block(&mut self) -> Result<(), TableError> {
        let payload_len = self.buf.len();
        let crc = crc32c::crc32c(&self.buf);
        let hash = blake3::hash(&self.buf);
        self.table_hasher.update(hash.as_bytes());
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf.extend_from_slice(hash.as_bytes());

        let offset = self.file.stream_position()?;
        self.file.write_all(&self.buf)?;
        let len: u32 = self
            .buf
            .len()
            .try_into()
            .map_err(|_| TableError::Corrupt("block too large"))?;

        let last_key = self
            .last_key
            .clone()
            .ok_or(TableError::Corrupt("missing last key"))?;
        self.index.push(IndexEntry {
            last_key,
            handle: BlockHandle { offset, len },
        });

        self.data_bytes += payload_len as u64;
        self.buf.clear();
        self.entries_in_block = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Substituted for zero sequence numbers on decode. Set for tables whose
    /// physical keys were written unstamped and stamped at ingest time.
    pub global_seqno: Option<u64>,
}

pub struct TableReader {
    path: PathBuf,
    mmap: Mmap,
    footer: Footer,
    index: Vec<IndexEntry>,
    props: TableProperties,
    range_dels: Vec<Span>,
    range_keys: Vec<Span>,
    global_seqno: Option<u64>,
}

impl TableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        Self::open_with_options(path, ReaderOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: ReaderOptions,
    ) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < MAGIC.len() + 4 {
            return Err(TableError::Corrupt("file too small"));
        }
        if &mmap[mmap.len() - MAGIC.len()..] != MAGIC {
            return Err(TableError::Corrupt("bad magic"));
        }
        let len_end = mmap.len() - MAGIC.len();
        let footer_len = u32::from_le_bytes(mmap[len_end - 4..len_end].try_into().unwrap()) as usize;
        if footer_len + 4 + MAGIC.len() > mmap.len() {
            return Err(TableError::Corrupt("bad footer length"));
        }
        let footer_start = len_end - 4 - footer_len;
        let footer: Footer = bincode::deserialize(&mmap[footer_start..len_end - 4])
            .map_err(|_| TableError::Corrupt("footer decode"))?;

        let index_bytes = checked_block(&mmap, footer.index_handle)?;
        let index: Vec<IndexEntry> =
            bincode::deserialize(index_bytes).map_err(|_| TableError::Corrupt("index decode"))?;
        let props_bytes = checked_block(&mmap, footer.props_handle)?;
        let props: TableProperties =
            bincode::deserialize(props_bytes).map_err(|_| TableError::Corrupt("props decode"))?;
        if props.table_root != footer.table_root {
            return Err(TableError::Corrupt("table root mismatch"));
        }

        let mut range_dels: Vec<Span> =
            bincode::deserialize(checked_block(&mmap, footer.range_del_handle)?)
                .map_err(|_| TableError::Corrupt("range-del decode"))?;
        let mut range_keys: Vec<Span> =
            bincode::deserialize(checked_block(&mmap, footer.range_key_handle)?)
                .map_err(|_| TableError::Corrupt("range-key decode"))?;
        if let Some(seqno) = options.global_seqno {
            for span in range_dels.iter_mut().chain(range_keys.iter_mut()) {
                if span.start.seqno == 0 {
                    span.start.seqno = seqno;
                }
            }
        }

        Ok(Self {
            path,
            mmap,
            footer,
            index,
            props,
            range_dels,
            range_keys,
            global_seqno: options.global_seqno,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn table_format(&self) -> u32 {
        self.footer.table_format
    }

    pub fn properties(&self) -> &TableProperties {
        &self.props
    }

    pub fn range_del_spans(&self) -> &[Span] {
        &self.range_dels
    }

    pub fn range_key_spans(&self) -> &[Span] {
        &self.range_keys
    }

    pub fn point_iter(&self) -> TablePointIter<'_> {
        TablePointIter::new(self)
    }

    /// Highest-seqno entry for `user_key` visible at `snapshot_seqno`.
    /// `Some((seqno, None))` reports a point tombstone; range deletions are
    /// the caller's concern via `range_del_spans`.
    pub fn get(
        &self,
        user_key: &[u8],
        snapshot_seqno: u64,
    ) -> Result<Option<(u64, Option<Bytes>)>, TableError> {
        let target = InternalKey::search_bound(Bytes::copy_from_slice(user_key));
        let mut block_idx = self.find_block(&target);
        while block_idx < self.index.len() {
            let entries = self.read_block(self.index[block_idx].handle)?;
            for (key, value) in entries.iter() {
                if key.user_key.as_ref() < user_key {
                    continue;
                }
                if key.user_key.as_ref() > user_key {
                    return Ok(None);
                }
                if key.seqno > snapshot_seqno {
                    continue;
                }
                match key.kind {
                    KeyKind::Set => return Ok(Some((key.seqno, Some(value.clone())))),
                    KeyKind::Delete => return Ok(Some((key.seqno, None))),
                    _ => continue,
                }
            }
            block_idx += 1;
        }
        Ok(None)
    }

    /// Re-reads every block and verifies checksums plus the table root.
    pub fn validate_block_checksums(&self) -> Result<(), TableError> {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.index {
            let (payload, crc_expected, hash_expected) = data_block_parts(&self.mmap, entry.handle)?;
            if crc32c::crc32c(payload) != crc_expected {
                return Err(TableError::Corrupt("data block crc mismatch"));
            }
            let hash = blake3::hash(payload);
            if hash.as_bytes() != &hash_expected {
                return Err(TableError::Corrupt("data block hash mismatch"));
            }
            hasher.update(hash.as_bytes());
        }
        hasher.update(checked_block(&self.mmap, self.footer.range_del_handle)?);
        hasher.update(checked_block(&self.mmap, self.footer.range_key_handle)?);
        hasher.update(checked_block(&self.mmap, self.footer.index_handle)?);
        checked_block(&self.mmap, self.footer.props_handle)?;
        if TableRoot(*hasher.finalize().as_bytes()) != self.footer.table_root {
            return Err(TableError::Corrupt("table root mismatch"));
        }
        Ok(())
    }

    /// Index of the first block whose last key is >= target.
    pub(crate) fn find_block(&self, target: &InternalKey) -> usize {
        self.index.partition_point(|entry| entry.last_key < *target)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn read_block_at(
        &self,
        index_pos: usize,
    ) -> Result<Vec<(InternalKey, Bytes)>, TableError> {
        self.read_block(self.index[index_pos].handle)
    }

    fn read_block(&self, handle: BlockHandle) -> Result<Vec<(InternalKey, Bytes)>, TableError> {
        let (payload, crc_expected, _hash) = data_block_parts(&self.mmap, handle)?;
        if crc32c::crc32c(payload) != crc_expected {
            return Err(TableError::Corrupt("data block crc mismatch"));
        }
        if payload.len() < 4 {
            return Err(TableError::Corrupt("data block truncated"));
        }
        let count = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let mut rest = &payload[4..];
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (mut key, after_key) = InternalKey::decode(rest)?;
            if after_key.len() < 4 {
                return Err(TableError::Corrupt("data block truncated"));
            }
            let val_len = u32::from_le_bytes(after_key[0..4].try_into().unwrap()) as usize;
            let after_len = &after_key[4..];
            if after_len.len() < val_len {
                return Err(TableError::Corrupt("data block truncated"));
            }
            let value = Bytes::copy_from_slice(&after_len[..val_len]);
            rest = &after_len[val_len..];
            if let Some(seqno) = self.global_seqno {
                if key.seqno == 0 {
                    key.seqno = seqno;
                }
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn data_block_parts(mmap: &Mmap, handle: BlockHandle) -> Result<(&[u8], u32, [u8; 32]), TableError> {
    let start = handle.offset as usize;
    let end = start + handle.len as usize;
    if end > mmap.len() {
        return Err(TableError::Corrupt("block handle out of bounds"));
    }
    if (handle.len as usize) <= BLOCK_TRAILER_SIZE {
        return Err(TableError::Corrupt("block too small"));
    }
    let payload_end = end - BLOCK_TRAILER_SIZE;
    let crc = u32::from_le_bytes(mmap[payload_end..payload_end + 4].try_into().unwrap());
    let hash: [u8; 32] = mmap[payload_end + 4..end].try_into().unwrap();
    Ok((&mmap[start..payload_end], crc, hash))
}

fn checked_block(mmap: &Mmap, handle: BlockHandle) -> Result<&[u8], TableError> {
    let start = handle.offset as usize;
    let end = start + handle.len as usize;
    if end > mmap.len() || handle.len < 4 {
        return Err(TableError::Corrupt("block handle out of bounds"));
    }
    let payload = &mmap[start..end - 4];
    let crc = u32::from_le_bytes(mmap[end - 4..end].try_into().unwrap());
    if crc32c::crc32c(payload) != crc {
        return Err(TableError::Corrupt("block crc mismatch"));
    }
    Ok(payload)
}

pub(crate) fn fsync_parent_dir(path: &Path) -> Result<(), TableError> {
    let parent = path
        .parent()
        .ok_or(TableError::Corrupt("path has no parent"))?;
    let dir = std::fs::File::open(parent)?;
    dir.sync_all()?;
    Ok(())
}
