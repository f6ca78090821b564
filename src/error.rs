//! Typed errors surfaced by the ingestion path.
//!
//! These travel through `anyhow` at the `Db` surface; callers that need to
//! distinguish them use `Error::downcast_ref::<IngestError>()`.

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("external table has corrupted key: {0}")]
    Corruption(String),

    #[error("table format {format} outside range [{min}, {max}] supported at this format major version")]
    FormatMismatch { format: u32, min: u32, max: u32 },

    #[error("external tables have overlapping ranges")]
    Overlap,

    #[error("database is read-only")]
    ReadOnly,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::sst::TableError> for IngestError {
    fn from(err: crate::sst::TableError) -> Self {
        match err {
            crate::sst::TableError::Io(e) => IngestError::Io(e),
            other => IngestError::Corruption(other.to_string()),
        }
    }
}
