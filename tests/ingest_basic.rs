use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use graftdb::internal_key::{InternalKey, KeyKind};
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
fn ingest_into_empty_db_lands_at_bottom_level() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    let source = build_external_sst(ext.path(), 42, &[("a", "1"), ("m", "2"), ("z", "3")])?;
    let stats = db.ingest_with_stats(&[&source])?;

    assert_eq!(db.get(b"m")?, Some(Bytes::from("2")));
    assert_eq!(db.get(b"a")?, Some(Bytes::from("1")));
    assert_eq!(db.get(b"q")?, None);

    // Nothing overlaps an empty tree: the file sits at the deepest level.
    assert_eq!(db.files_at_level(6).len(), 1);
    assert!(stats.bytes > 0);
    assert_eq!(stats.approx_bytes_into_l0, 0);

    let ingested = events.ingested.lock().unwrap();
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].tables.len(), 1);
    assert_eq!(ingested[0].tables[0].level, 6);
    assert!(ingested[0].err.is_none());
    assert!(!ingested[0].flushable);

    assert!(!source.exists(), "original must be removed on success");
    db.close();
    Ok(())
}

#[test]
fn ingest_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        let source = build_external_sst(ext.path(), 1, &[("k", "v")])?;
        db.ingest(&[&source])?;
        assert_eq!(db.get(b"k")?, Some(Bytes::from("v")));
        db.close();
    }

    // Reopen replays the manifest and still sees the ingested file.
    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get(b"k")?, Some(Bytes::from("v")));
    assert_eq!(db.files_at_level(6).len(), 1);
    db.close();
    Ok(())
}

#[test]
fn empty_file_is_elided() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    let empty = {
        let builder = TableBuilder::create(ext.path(), 7, 4 * 1024, TABLE_FORMAT_V2)?;
        builder.finish()?;
        ext.path().join("sst_0000000000000007.sst")
    };
    let full = build_external_sst(ext.path(), 8, &[("a", "1")])?;

    db.ingest(&[&empty, &full])?;

    // The empty table is dropped: one table in the event, one sequence
    // number consumed.
    let ingested = events.ingested.lock().unwrap();
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].tables.len(), 1);
    assert_eq!(db.get(b"a")?, Some(Bytes::from("1")));
    drop(ingested);

    // An ingest of only empty tables is a no-op and emits no event.
    let empty2 = {
        let builder = TableBuilder::create(ext.path(), 9, 4 * 1024, TABLE_FORMAT_V2)?;
        builder.finish()?;
        ext.path().join("sst_0000000000000009.sst")
    };
    let stats = db.ingest_with_stats(&[&empty2])?;
    assert_eq!(stats, graftdb::IngestStats::default());
    assert_eq!(events.ingested.lock().unwrap().len(), 1);

    db.close();
    Ok(())
}

#[test]
fn sequence_numbers_are_contiguous_per_ingest() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    let a = build_external_sst(ext.path(), 1, &[("a", "1"), ("c", "2")])?;
    let b = build_external_sst(ext.path(), 2, &[("f", "3")])?;
    db.ingest(&[&a, &b])?;

    let c = build_external_sst(ext.path(), 3, &[("x", "4")])?;
    db.ingest(&[&c])?;

    let ingested = events.ingested.lock().unwrap();
    assert_eq!(ingested.len(), 2);
    // Two tables in the first call consume two contiguous sequence
    // numbers; the next call continues directly after them.
    assert_eq!(ingested[0].tables.len(), 2);
    assert_eq!(ingested[1].global_seqno, ingested[0].global_seqno + 2);

    db.close();
    Ok(())
}

#[test]
fn multiple_disjoint_tables_install_atomically() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    let db = Db::open(dir.path(), DbOptions::default())?;
    let a = build_external_sst(ext.path(), 1, &[("a", "1"), ("c", "2")])?;
    let b = build_external_sst(ext.path(), 2, &[("m", "3"), ("p", "4")])?;
    let c = build_external_sst(ext.path(), 3, &[("x", "5")])?;

    db.ingest(&[&c, &a, &b])?;

    for (key, want) in [("a", "1"), ("c", "2"), ("m", "3"), ("p", "4"), ("x", "5")] {
        assert_eq!(db.get(key.as_bytes())?, Some(Bytes::copy_from_slice(want.as_bytes())));
    }
    // All three are disjoint from each other and from the empty tree.
    assert_eq!(db.files_at_level(6).len(), 3);
    db.close();
    Ok(())
}
