//! Manifest: the persistent log of version edits.
//!
//! Records are framed as `[len u32][bincode payload]` and replayed in order
//! on open. The manifest follows a strict append + fsync + dir-sync
//! discipline; an edit is durable only once its record is synced.

use std::collections::BTreeMap;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::version::FileMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestRecord {
    VersionEdit(VersionEditRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VersionEditRecord {
    pub new_files: Vec<NewFileRecord>,
    pub deleted_files: Vec<DeletedFileRecord>,
    /// WAL segments below this number are fully flushed and reclaimable.
    pub min_unflushed_log_num: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFileRecord {
    pub level: usize,
    pub meta: FileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedFileRecord {
    pub level: usize,
    pub file_num: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    pub levels: BTreeMap<usize, BTreeMap<u64, FileMetadata>>,
    pub min_unflushed_log_num: u64,
}

#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    file: std::fs::File,
}

impl Manifest {
    pub fn open(dir: &Path) -> anyhow::Result<(Self, ManifestState)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("MANIFEST");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let mut data = Vec::new();
        file.seek(std::io::SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        let state = replay_manifest(&data)?;
        Ok((Self { path, file }, state))
    }

    pub fn append(&mut self, record: &ManifestRecord, sync: bool) -> anyhow::Result<()> {
        let payload = bincode::serialize(record)?;
        let len: u32 = payload.len().try_into()?;
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        use std::io::Write;
        self.file.write_all(&buf)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn sync_dir(&self) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("manifest has no parent"))?;
        let dir_fd = std::fs::File::open(parent)?;
        dir_fd.sync_all()?;
        Ok(())
    }
}

fn replay_manifest(data: &[u8]) -> anyhow::Result<ManifestState> {
    let mut offset = 0usize;
    let mut state = ManifestState::default();
    while offset + 4 <= data.len() {
        let len = u32::from_le_bytes(data[offset..(offset + 4)].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > data.len() {
            // A torn tail record is the expected crash artifact; everything
            // before it is intact.
            break;
        }
        let record: ManifestRecord = bincode::deserialize(&data[offset..(offset + len)])?;
        apply_record(&mut state, record);
        offset += len;
    }
    Ok(state)
}

fn apply_record(state: &mut ManifestState, record: ManifestRecord) {
    match record {
        ManifestRecord::VersionEdit(edit) => {
            for add in edit.new_files {
                state
                    .levels
                    .entry(add.level)
                    .or_default()
                    .insert(add.meta.file_num, add.meta);
            }
            for del in edit.deleted_files {
                if let Some(level) = state.levels.get_mut(&del.level) {
                    level.remove(&del.file_num);
                }
            }
            if let Some(log_num) = edit.min_unflushed_log_num {
                if log_num > state.min_unflushed_log_num {
                    state.min_unflushed_log_num = log_num;
                }
            }
        }
    }
}
