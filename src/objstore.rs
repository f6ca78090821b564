//! Object store: the database-owned namespace of table files.
//!
//! Tables live under `<db>/sst` as `sst_{file_num:016x}.sst`. External
//! files are installed by hardlink when the source shares a filesystem with
//! the store, falling back to a byte copy.

use std::path::{Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    pub fn open(db_dir: &Path) -> anyhow::Result<Self> {
        let dir = db_dir.join("sst");
        std::fs::create_dir_all(&dir).with_context(|| format!("create sst dir {dir:?}"))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, file_num: u64) -> PathBuf {
        self.dir.join(format!("sst_{file_num:016x}.sst"))
    }

    /// Installs `src` as table `file_num`, preferring a hardlink and falling
    /// back to a copy across filesystem boundaries. The copy is synced
    /// before rename so a crash cannot leave a torn object at the final
    /// name.
    pub fn link_or_copy_from_local(&self, src: &Path, file_num: u64) -> anyhow::Result<PathBuf> {
        let dst = self.path_of(file_num);
        match std::fs::hard_link(src, &dst) {
            Ok(()) => return Ok(dst),
            Err(err) => {
                tracing::debug!(
                    src = %src.display(),
                    dst = %dst.display(),
                    error = %err,
                    "hardlink failed, falling back to copy"
                );
            }
        }

        let tmp = dst.with_extension("tmp");
        let _ = std::fs::remove_file(&tmp);
        std::fs::copy(src, &tmp)
            .with_context(|| format!("copy {} -> {}", src.display(), tmp.display()))?;
        let fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open tmp object {}", tmp.display()))?;
        fd.sync_data()
            .with_context(|| format!("sync tmp object {}", tmp.display()))?;
        drop(fd);
        std::fs::rename(&tmp, &dst)
            .with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
        Ok(dst)
    }

    pub fn remove(&self, file_num: u64) -> anyhow::Result<()> {
        let path = self.path_of(file_num);
        std::fs::remove_file(&path).with_context(|| format!("remove object {}", path.display()))
    }

    pub fn sync_dir(&self) -> anyhow::Result<()> {
        let fd = std::fs::File::open(&self.dir)
            .with_context(|| format!("open sst dir {}", self.dir.display()))?;
        fd.sync_all()
            .with_context(|| format!("sync sst dir {}", self.dir.display()))?;
        Ok(())
    }

    /// File numbers of every table object currently in the store.
    pub fn list(&self) -> anyhow::Result<Vec<u64>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(file_num) = parse_table_file_num(name) {
                out.push(file_num);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

fn parse_table_file_num(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("sst_")?.strip_suffix(".sst")?;
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_then_list_then_remove() -> anyhow::Result<()> {
        let db = tempfile::TempDir::new()?;
        let ext = tempfile::TempDir::new()?;
        let src = ext.path().join("table.sst");
        std::fs::write(&src, b"payload")?;

        let store = ObjectStore::open(db.path())?;
        let installed = store.link_or_copy_from_local(&src, 9)?;
        assert!(installed.exists());
        assert!(src.exists(), "source must be preserved");
        assert_eq!(store.list()?, vec![9]);

        store.remove(9)?;
        assert_eq!(store.list()?, Vec::<u64>::new());
        Ok(())
    }

    #[test]
    fn parses_table_names_only() {
        assert_eq!(parse_table_file_num("sst_000000000000002a.sst"), Some(42));
        assert_eq!(parse_table_file_num("sst_000000000000002a.tmp"), None);
        assert_eq!(parse_table_file_num("wal_0000000000000001.log"), None);
    }
}
