//! Segmented write-ahead log.
//!
//! One segment per flushable-queue generation, named
//! `wal_{log_num:016x}.log` in the database directory. Records are framed
//! as `[len u32][crc32c u32][bincode payload]`; a torn or corrupt tail
//! record ends replay of that segment. An ingest spliced into the flushable
//! queue writes a dedicated segment holding a single record that references
//! the ingested files by number.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::Op;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    Batch { seqno: u64, ops: Vec<Op> },
    IngestedTables { seqno: u64, file_nums: Vec<u64> },
}

impl WalRecord {
    pub fn last_seqno(&self) -> u64 {
        match self {
            WalRecord::Batch { seqno, ops } => seqno + ops.len().max(1) as u64 - 1,
            WalRecord::IngestedTables { seqno, file_nums } => {
                seqno + file_nums.len().max(1) as u64 - 1
            }
        }
    }
}

#[derive(Debug)]
struct ActiveSegment {
    log_num: u64,
    file: std::fs::File,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    sync_writes: bool,
    active: Mutex<ActiveSegment>,
}

impl Wal {
    pub fn open(dir: &Path, log_num: u64, sync_writes: bool) -> anyhow::Result<Self> {
        let file = open_segment(dir, log_num)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_writes,
            active: Mutex::new(ActiveSegment { log_num, file }),
        })
    }

    pub fn active_log_num(&self) -> u64 {
        self.active.lock().log_num
    }

    /// Starts a new segment; the previous one is finished and belongs to
    /// the flushable it fed.
    pub fn rotate(&self, log_num: u64) -> anyhow::Result<()> {
        let mut active = self.active.lock();
        active.file.sync_data().context("sync wal before rotate")?;
        let file = open_segment(&self.dir, log_num)?;
        *active = ActiveSegment { log_num, file };
        Ok(())
    }

    pub fn append(&self, record: &WalRecord) -> anyhow::Result<()> {
        let payload = bincode::serialize(record).context("encode wal record")?;
        let len: u32 = payload.len().try_into().context("wal record too large")?;
        let crc = crc32c::crc32c(&payload);
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut active = self.active.lock();
        active.file.write_all(&buf).context("append wal record")?;
        if self.sync_writes {
            active.file.sync_data().context("sync wal record")?;
        }
        Ok(())
    }

    /// Replays every segment at or above `min_log_num`, oldest first.
    pub fn replay(dir: &Path, min_log_num: u64) -> anyhow::Result<Vec<(u64, Vec<WalRecord>)>> {
        let mut segments = list_segments(dir)?;
        segments.retain(|log_num| *log_num >= min_log_num);
        segments.sort_unstable();

        let mut out = Vec::with_capacity(segments.len());
        for log_num in segments {
            let data = std::fs::read(segment_path(dir, log_num))?;
            out.push((log_num, decode_segment(&data)));
        }
        Ok(out)
    }

    /// Removes segments fully covered by the manifest's flushed watermark.
    pub fn remove_obsolete(dir: &Path, min_log_num: u64) -> anyhow::Result<usize> {
        let mut removed = 0usize;
        for log_num in list_segments(dir)? {
            if log_num < min_log_num {
                std::fs::remove_file(segment_path(dir, log_num))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn segment_path(dir: &Path, log_num: u64) -> PathBuf {
    dir.join(format!("wal_{log_num:016x}.log"))
}

fn open_segment(dir: &Path, log_num: u64) -> anyhow::Result<std::fs::File> {
    let path = segment_path(dir, log_num);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open wal segment {}", path.display()))
}

fn list_segments(dir: &Path) -> anyhow::Result<Vec<u64>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(hex) = name.strip_prefix("wal_").and_then(|n| n.strip_suffix(".log")) else {
            continue;
        };
        if let Ok(log_num) = u64::from_str_radix(hex, 16) {
            out.push(log_num);
        }
    }
    Ok(out)
}

fn decode_segment(data: &[u8]) -> Vec<WalRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
        offset += 8;
        if offset + len > data.len() {
            break;
        }
        let payload = &data[offset..offset + len];
        if crc32c::crc32c(payload) != crc {
            break;
        }
        match bincode::deserialize::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset += len;
    }
    records
}
