//! Drives catalog creation, a full backup, and an incremental backup
//! through the real copier/page-codec/manifest/catalog code together,
//! without a live PostgreSQL connection (the control-protocol client is
//! exercised only in isolation elsewhere, since it needs a real server).

use std::fs;
use std::os::unix::fs::FileExt;

use camino::Utf8Path;
use chrono::Utc;

use pg_backup::backup::{Backup, BackupMode, BackupStatus};
use pg_backup::catalog::{Catalog, LockOutcome};
use pg_backup::copier::{self, CopyOptions};
use pg_backup::filelist;
use pg_backup::manifest::Manifest;
use pg_backup::progress::NullProgress;

const BLCKSZ: usize = 8192;

fn write_page(buf: &mut [u8], blkno: u32, lsn: u64) {
    buf[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
    for (i, b) in buf[24..].iter_mut().enumerate() {
        *b = (i % 200 + 1) as u8;
    }
    let checksum = postgres_ffi::page::checksum_page(buf, blkno);
    buf[8..10].copy_from_slice(&checksum.to_le_bytes());
}

/// Runs one pass of file-list + copy over `pgdata_root`, writing the result
/// into `catalog`'s backup directory for `backup`, and returns the manifest.
fn run_copy_pass(
    pgdata_root: &Utf8Path,
    catalog: &Catalog,
    backup: &Backup,
    base: Option<&Backup>,
) -> Manifest {
    let database_dir = catalog.backups_dir().join(&backup.id).join("database");
    let entries = filelist::walk(pgdata_root).unwrap();
    copier::check_clock_skew(&entries, Utc::now()).unwrap();

    let prev_manifest = base.map(|b| {
        let text = fs::read_to_string(
            catalog
                .backups_dir()
                .join(&b.id)
                .join("database")
                .join("file_database.txt")
                .as_std_path(),
        )
        .unwrap();
        Manifest::parse(&text).unwrap()
    });

    let opts = CopyOptions {
        base_lsn: base.map(|b| b.start_lsn),
        checksums_enabled: true,
        compress: false,
    };

    let mut manifest = Manifest::new();
    let mut sink = NullProgress;
    for entry in &entries {
        let prev_entry = prev_manifest.as_ref().and_then(|m| m.get(&entry.path));
        let me = copier::copy_entry(entry, &database_dir, prev_entry, &opts, &mut sink).unwrap();
        manifest.push(me);
    }
    let manifest = manifest.finish().unwrap();
    fs::write(
        database_dir.join("file_database.txt").as_std_path(),
        manifest.serialize(),
    )
    .unwrap();
    manifest
}

#[test]
fn full_then_incremental_captures_exactly_the_changed_block() {
    let catalog_dir = camino_tempfile::tempdir().unwrap();
    let pgdata_dir = camino_tempfile::tempdir().unwrap();
    let catalog = Catalog::new(catalog_dir.path().to_path_buf());

    let lock = match catalog.lock().unwrap() {
        LockOutcome::Acquired(l) => l,
        LockOutcome::Held => panic!("catalog should be free"),
    };

    let pgdata = pgdata_dir.path();
    fs::create_dir_all(pgdata.join("base/16384").as_std_path()).unwrap();
    fs::write(pgdata.join("PG_VERSION").as_std_path(), b"16\n").unwrap();

    // A 4-block relation segment, all blocks written before the full backup ran.
    let seg_path = pgdata.join("base/16384/16385");
    let mut seg = vec![0u8; BLCKSZ * 4];
    for blk in 0..4 {
        write_page(&mut seg[blk * BLCKSZ..(blk + 1) * BLCKSZ], blk as u32, 100);
    }
    fs::write(seg_path.as_std_path(), &seg).unwrap();

    // FULL backup. Its start_lsn (200) is the incremental low-water mark the
    // next backup will filter against, per how `copy_data_phase` wires
    // `base_lsn` from `base.start_lsn`.
    let t0 = Utc::now();
    let mut full = Backup::new_running(Backup::id_for_time(t0), t0, BackupMode::Full);
    full.timeline = 1;
    full.start_lsn = utils::lsn::Lsn(200);
    full.block_size = BLCKSZ as u32;
    full.wal_block_size = BLCKSZ as u32;
    catalog.create_backup_dir(&full).unwrap();
    let full_manifest = run_copy_pass(pgdata, &catalog, &full, None);
    full.status = BackupStatus::Done;
    full.end_time = Some(Utc::now());
    catalog.write_metadata(&full).unwrap();

    let full_seg_entry = full_manifest.get(Utf8Path::new("base/16384/16385")).unwrap();
    // magic + 4 records of (blkno + page) + sentinel blkno + trailing crc.
    assert_eq!(full_seg_entry.write_size, (4 + 4 * (4 + BLCKSZ) + 8) as i64);

    // Modify block 2 at a later LSN, reachable by the next incremental.
    let file = fs::OpenOptions::new().write(true).open(seg_path.as_std_path()).unwrap();
    let mut block = vec![0u8; BLCKSZ];
    write_page(&mut block, 2, 500);
    file.write_at(&block, 2 * BLCKSZ as u64).unwrap();
    drop(file);

    // INCREMENTAL backup based on the FULL.
    let t1 = Utc::now();
    let mut incr = Backup::new_running(Backup::id_for_time(t1), t1, BackupMode::Incremental);
    incr.timeline = 1;
    incr.start_lsn = utils::lsn::Lsn(600);
    incr.block_size = BLCKSZ as u32;
    incr.wal_block_size = BLCKSZ as u32;
    catalog.create_backup_dir(&incr).unwrap();

    let base = catalog.select_incremental_base(1).unwrap().unwrap();
    assert_eq!(base.id, full.id);

    let incr_manifest = run_copy_pass(pgdata, &catalog, &incr, Some(&base));
    incr.status = BackupStatus::Done;
    incr.end_time = Some(Utc::now());
    catalog.write_metadata(&incr).unwrap();

    let incr_seg_entry = incr_manifest.get(Utf8Path::new("base/16384/16385")).unwrap();
    // magic + exactly one (blkno, page) record + sentinel + crc: only the
    // block rewritten above base_lsn=200 survives the filter.
    assert_eq!(incr_seg_entry.write_size, (4 + (4 + BLCKSZ) + 8) as i64);

    // PG_VERSION's mtime didn't change between passes: incremental skips it.
    let version_entry = incr_manifest.get(Utf8Path::new("PG_VERSION")).unwrap();
    assert!(version_entry.is_skipped());

    drop(lock);
}

#[test]
fn retention_sweep_keeps_the_base_a_kept_incremental_depends_on() {
    let catalog_dir = camino_tempfile::tempdir().unwrap();
    let catalog = Catalog::new(catalog_dir.path().to_path_buf());
    let now = Utc::now();

    let mut base = Backup::new_running("20260101T000000".into(), now - chrono::Duration::days(40), BackupMode::Full);
    base.status = BackupStatus::Done;
    base.timeline = 1;
    base.block_size = 8192;
    base.wal_block_size = 8192;
    catalog.create_backup_dir(&base).unwrap();

    let mut incr = Backup::new_running("20260102T000000".into(), now - chrono::Duration::days(1), BackupMode::Incremental);
    incr.status = BackupStatus::Done;
    incr.timeline = 1;
    incr.block_size = 8192;
    incr.wal_block_size = 8192;
    catalog.create_backup_dir(&incr).unwrap();

    // keep_generations=1, keep_days=5: only the incremental is within both
    // thresholds directly, but the base it depends on must survive too.
    let deleted = catalog.sweep_retention(1, 5, now).unwrap();
    assert!(!deleted.contains(&base.id));
    assert!(!deleted.contains(&incr.id));
}

#[test]
fn archive_retention_always_keeps_history_files() {
    let catalog_dir = camino_tempfile::tempdir().unwrap();
    let catalog = Catalog::new(catalog_dir.path().to_path_buf());
    let now = Utc::now();
    let old = now - chrono::Duration::days(100);

    let history = catalog.timeline_history_dir().join("00000001.history");
    let segment = catalog.timeline_history_dir().join("000000010000000000000001");
    fs::create_dir_all(catalog.timeline_history_dir().as_std_path()).unwrap();
    fs::write(history.as_std_path(), b"").unwrap();
    fs::write(segment.as_std_path(), b"").unwrap();

    let mut files = vec![(history.clone(), old), (segment.clone(), old)];
    let deleted = catalog.sweep_archive_retention(&mut files, 0, 30, now).unwrap();

    assert!(deleted.contains(&segment));
    assert!(!deleted.contains(&history));
    assert!(history.as_std_path().exists());
}
