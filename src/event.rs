//! Event hooks emitted by ingestion.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TableCreateInfo {
    pub job_id: u64,
    pub reason: &'static str,
    pub path: PathBuf,
    pub file_num: u64,
}

#[derive(Debug, Clone)]
pub struct IngestedTable {
    pub file_num: u64,
    pub size: u64,
    /// Final level, or -1 when installed as a flushable entry.
    pub level: i32,
}

#[derive(Debug, Clone)]
pub struct TableIngestInfo {
    pub job_id: u64,
    pub global_seqno: u64,
    pub tables: Vec<IngestedTable>,
    /// Total bytes across the ingested tables.
    pub bytes: u64,
    /// Bytes that landed at L0; zero for a flushable installation.
    pub approx_bytes_into_l0: u64,
    pub err: Option<String>,
    pub flushable: bool,
}

#[derive(Debug, Clone)]
pub struct TableValidatedInfo {
    pub job_id: u64,
    pub file_num: u64,
    pub level: i32,
}

/// Callbacks fired at ingestion milestones. All methods default to no-ops;
/// implementations must be cheap and must not call back into the database.
pub trait EventListener: Send + Sync {
    fn table_created(&self, _info: &TableCreateInfo) {}
    fn table_ingested(&self, _info: &TableIngestInfo) {}
    fn table_validated(&self, _info: &TableValidatedInfo) {}
}

pub(crate) struct NoopListener;

impl EventListener for NoopListener {}
