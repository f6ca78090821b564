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
fn overlapping_ingest_splices_in_as_flushable() -> anyhow::Result<()> {
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

    db.put("m", "old")?;
    let source = build_external_sst(ext.path(), 42, &[("m", "new")])?;
    db.ingest(&[&source])?;

    // Capacity was available, so the tables slid on top of the memtable
    // instead of waiting out a flush.
    {
        let ingested = events.ingested.lock().unwrap();
        assert_eq!(ingested.len(), 1);
        assert!(ingested[0].flushable);
        assert_eq!(ingested[0].tables.len(), 1);
        assert_eq!(ingested[0].tables[0].level, -1);
        assert!(ingested[0].err.is_none());
    }

    // Reads see the spliced tables immediately.
    assert_eq!(db.get(b"m")?, Some(Bytes::from("new")));

    // The background flush eventually gives the tables a real placement;
    // the ingested value stays on top.
    db.flush()?;
    assert_eq!(db.get(b"m")?, Some(Bytes::from("new")));
    let placed: usize = (0..7).map(|l| db.files_at_level(l).len()).sum();
    assert_eq!(placed, 2, "memtable table + ingested table");
    db.close();
    Ok(())
}

#[test]
fn splice_orders_ingest_above_older_memtable_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;

    let db = Db::open(dir.path(), DbOptions::default())?;
    db.put("k", "one")?;
    let source = build_external_sst(ext.path(), 1, &[("k", "two")])?;
    db.ingest(&[&source])?;
    // A write after the ingest gets a higher sequence number again.
    db.put("k", "three")?;

    assert_eq!(db.get(b"k")?, Some(Bytes::from("three")));
    db.flush()?;
    assert_eq!(db.get(b"k")?, Some(Bytes::from("three")));
    db.close();
    Ok(())
}

#[test]
fn queue_at_stop_writes_threshold_forces_flush_instead() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            memtable_stop_writes_threshold: 1,
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    db.put("m", "old")?;
    let source = build_external_sst(ext.path(), 1, &[("m", "new")])?;
    db.ingest(&[&source])?;

    let ingested = events.ingested.lock().unwrap();
    assert!(!ingested[0].flushable, "no capacity to splice");
    assert!(ingested[0].tables[0].level >= 0);
    assert_eq!(db.get(b"m")?, Some(Bytes::from("new")));
    db.close();
    Ok(())
}

#[test]
fn base_format_version_cannot_splice() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ext = TempDir::new()?;
    let events = std::sync::Arc::new(CapturedEvents::default());

    let db = Db::open(
        dir.path(),
        DbOptions {
            format_major_version: graftdb::FormatMajorVersion::Base,
            event_listener: events.clone(),
            ..Default::default()
        },
    )?;

    db.put("m", "old")?;
    let source = {
        // The base format only opens v1 tables.
        let mut builder =
            TableBuilder::create(ext.path(), 3, 4 * 1024, graftdb::sst::TABLE_FORMAT_V1)?;
        builder.add(&InternalKey::new(Bytes::from("m"), 0, KeyKind::Set), b"new")?;
        builder.finish()?;
        ext.path().join("sst_0000000000000003.sst")
    };
    db.ingest(&[&source])?;

    let ingested = events.ingested.lock().unwrap();
    assert!(
        !ingested[0].flushable,
        "flushable ingest requires the newer format major version"
    );
    assert_eq!(db.get(b"m")?, Some(Bytes::from("new")));
    db.close();
    Ok(())
}
