use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use graftdb::compaction::CompactionInfo;
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

fn last_level(events: &CapturedEvents) -> i32 {
    let ingested = events.ingested.lock().unwrap();
    ingested.last().expect("ingest event").tables[0].level
}

#[test]
fn data_overlap_places_above_the_overlapped_level() -> anyhow::Result<()> {
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
    db.ingest(&[&a])?;
    assert_eq!(last_level(&events), 6);

    // Data overlap with the bottom file: the new table stops one level
    // above it.
    let b = build_external_sst(ext.path(), 2, &[("b", "3")])?;
    db.ingest(&[&b])?;
    assert_eq!(last_level(&events), 5);
    assert_eq!(db.get(b"b")?, Some(Bytes::from("3")));

    // No overlap with anything: straight to the bottom of the eligible
    // range.
    let c = build_external_sst(ext.path(), 3, &[("x", "4")])?;
    db.ingest(&[&c])?;
    assert_eq!(last_level(&events), 6);
    db.close();
    Ok(())
}

#[test]
fn boundary_overlap_without_data_overlap_skips_the_level() -> anyhow::Result<()> {
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

    // Bounds [a, z] with nothing between the endpoints.
    let wide = build_external_sst(ext.path(), 1, &[("a", "1"), ("z", "2")])?;
    db.ingest(&[&wide])?;
    assert_eq!(last_level(&events), 6);

    // [m, n] sits inside the boundary interval of the L6 file but has no
    // data overlap: L6 is skipped for the boundary, leaving the level
    // above.
    let inner = build_external_sst(ext.path(), 2, &[("m", "3"), ("n", "4")])?;
    db.ingest(&[&inner])?;
    assert_eq!(last_level(&events), 5);
    db.close();
    Ok(())
}

#[test]
fn in_progress_compaction_output_range_is_avoided() -> anyhow::Result<()> {
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

    // A compaction writing into L6 over [a, p] makes every level of the
    // walk ineligible for an overlapping ingest: it falls back to L0.
    let token = db.register_compaction(CompactionInfo {
        output_level: 6,
        smallest: Bytes::from("a"),
        largest: Bytes::from("p"),
    });
    let a = build_external_sst(ext.path(), 1, &[("c", "1")])?;
    db.ingest(&[&a])?;
    assert_eq!(last_level(&events), 0);

    // Once the compaction completes, the same range is eligible again.
    db.complete_compaction(token);
    let b = build_external_sst(ext.path(), 2, &[("x", "2")])?;
    db.ingest(&[&b])?;
    assert_eq!(last_level(&events), 6);
    db.close();
    Ok(())
}

#[test]
fn l0_data_overlap_returns_l0() -> anyhow::Result<()> {
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

    // Park one table at L0 by ingesting under a compaction that covers
    // every deeper level's eligibility for its range.
    let token = db.register_compaction(CompactionInfo {
        output_level: 6,
        smallest: Bytes::from("a"),
        largest: Bytes::from("z"),
    });
    let first = build_external_sst(ext.path(), 1, &[("k", "old")])?;
    db.ingest(&[&first])?;
    assert_eq!(last_level(&events), 0);
    db.complete_compaction(token);

    // Data overlap with the L0 file keeps the newer table at L0 as well.
    let second = build_external_sst(ext.path(), 2, &[("k", "new")])?;
    db.ingest(&[&second])?;
    assert_eq!(last_level(&events), 0);
    assert_eq!(db.files_at_level(0).len(), 2);
    assert_eq!(db.get(b"k")?, Some(Bytes::from("new")));
    db.close();
    Ok(())
}

#[test]
fn compaction_on_another_level_does_not_block_placement() -> anyhow::Result<()> {
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

    // Output range matches, but the output level is not on the walk's
    // path for an empty tree (base level is the bottom).
    let token = db.register_compaction(CompactionInfo {
        output_level: 3,
        smallest: Bytes::from("a"),
        largest: Bytes::from("z"),
    });
    let a = build_external_sst(ext.path(), 1, &[("c", "1")])?;
    db.ingest(&[&a])?;
    assert_eq!(last_level(&events), 6);
    db.complete_compaction(token);
    db.close();
    Ok(())
}
