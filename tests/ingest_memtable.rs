use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use graftdb::internal_key::{InternalKey, KeyKind, Span};
use graftdb::sst::{TableBuilder, TABLE_FORMAT_V2};
use graftdb::{Db, DbOptions, EventListener, TableIngestInfo};
use tempfile::TempDir;

#[derive(Default)]
struct CapturedEvents {
    ingested: Mutex<Vec<TableIngestInfo>>,
}

impl EventListener for CapturedEvents {
    fn table_ingested(&self, info: &TableIngestInfo) {
        self.ingested.lock().unwrap().push(info.clone());
    }
}

fn build_external_sst(
    dir: &Path,
    file_num: u64,
    entries: &[(&str, &str)],
) -> anyhow::Result<PathBuf> {
    let mut builder = TableBuilder::create(dir, file_num, 4 * 1024, TABLE_FORMAT_V2)?;
    for (key, value) in entries {
        builder.add(
            &InternalKey::new(Bytes::copy_from_slice(key.as_bytes()), 0, KeyKind::Set),
            value.as_bytes(),
        )?;
    }
    builder.finish()?;
    Ok(dir.join(format!("sst_{file_num:016x}.sst")))
}

#[test]
fn overlapping_mutable_memtable_is_flushed_first() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            disable_ingest_as_flushable: true,
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    db.put("m", "old")?;
    let source = build_external_sst(ext.path(), 42, &[("m", "new")])?;
    db.ingest(&[&source])?;

    // The memtable was rotated and flushed before the ingest's version
    // edit; its table sits at the bottom, the ingested table above it at a
    // disjoint level.
    assert_eq!(db.get(b"m")?, Some(Bytes::from("new")));
    assert_eq!(db.files_at_level(6).len(), 1);

    let ingested = events.ingested.lock().unwrap();
    assert_eq!(ingested.len(), 1);
    assert!(!ingested[0].flushable);
    let level = ingested[0].tables[0].level;
    assert!(level > 0, "expected placement above L0, got {level}");
    assert!(level < 6, "expected placement above the flushed table");
    assert_eq!(db.files_at_level(level as usize).len(), 1);
    db.close();
    Ok(())
}

#[test]
fn disjoint_memtable_does_not_force_flush() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    let db = Db::open(
        dir.path(),
        DbOptions {
            disable_ingest_as_flushable: true,
            ..Default::default()
        },
    )?;

    db.put("a", "mem")?;
    let source = build_external_sst(ext.path(), 1, &[("x", "ing")])?;
    db.ingest(&[&source])?;

    // The memtable stays queued: both values readable, nothing flushed.
    assert_eq!(db.get(b"a")?, Some(Bytes::from("mem")));
    assert_eq!(db.get(b"x")?, Some(Bytes::from("ing")));
    assert_eq!(db.metrics().flushable_queue_len, 1);
    db.close();
    Ok(())
}

#[test]
fn range_delete_in_memtable_shadows_ingest_bounds() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    let db = Db::open(
        dir.path(),
        DbOptions {
            disable_ingest_as_flushable: true,
            ..Default::default()
        },
    )?;

    // The span [a, c) overlaps an ingest of [b, b] even though no point
    // key does.
    db.delete_range("a", "c")?;
    let source = build_external_sst(ext.path(), 1, &[("b", "v")])?;
    db.ingest(&[&source])?;

    // The overlap forced the memtable (holding the span) to flush below
    // the ingest; the ingested value is newer than the span.
    assert_eq!(db.get(b"b")?, Some(Bytes::from("v")));
    db.close();
    Ok(())
}

#[test]
fn ingested_range_delete_shadows_older_data() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    let db = Db::open(dir.path(), DbOptions::default())?;
    db.put("b", "old")?;
    db.flush()?;
    assert_eq!(db.get(b"b")?, Some(Bytes::from("old")));

    // A table holding only a range deletion [a, c).
    let source = {
        let mut builder = TableBuilder::create(ext.path(), 9, 4 * 1024, TABLE_FORMAT_V2)?;
        builder.add_range_del(Span::new(
            InternalKey::new(Bytes::from("a"), 0, KeyKind::RangeDelete),
            Bytes::from("c"),
        ))?;
        builder.finish()?;
        ext.path().join("sst_0000000000000009.sst")
    };
    db.ingest(&[&source])?;

    assert_eq!(db.get(b"b")?, None, "range delete must shadow older data");
    db.close();
    Ok(())
}
