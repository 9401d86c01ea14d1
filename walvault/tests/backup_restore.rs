//! Backup and restore scenarios over a posix repository with a scripted
//! database.

mod common;

use std::sync::Arc;

use common::*;
use walvault::backup::label::BackupType;
use walvault::backup::manifest::Manifest;
use walvault::backup::run_backup;
use walvault::restore::resolver::{self, RecoveryTarget, TargetType};
use walvault::restore::{run_restore, RestoreOptions};
use walvault::Context;

const WAL_A: &str = "000000010000000100000001";
const WAL_B: &str = "000000010000000100000002";
const WAL_C: &str = "000000010000000100000003";

/// Seed the archive with the WAL the scripted backup will claim to span.
async fn seed_backup_wal(fx: &Fixture, start: &str, stop: &str) {
    for (repo, _) in fx.ctx.repos() {
        fx.seed_archived_segment(repo.index, start, &craft_segment_bytes(start, 0x01))
            .await;
        if stop != start {
            fx.seed_archived_segment(repo.index, stop, &craft_segment_bytes(stop, 0x02))
                .await;
        }
    }
}

fn cluster_sha1s(pg_path: &camino::Utf8Path, files: &[&str]) -> Vec<(String, String)> {
    files
        .iter()
        .map(|f| {
            let content = std::fs::read(pg_path.join(f)).unwrap();
            (f.to_string(), sha1_hex(&content))
        })
        .collect()
}

#[tokio::test]
async fn full_backup_then_restore_reproduces_the_cluster() {
    let fx = Fixture::new(1).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");
    write_cluster_file(&pg, "global/pg_control", &vec![0x42u8; 512]);
    write_cluster_file(&pg, "base/1/1259", &vec![0u8; 16384]);
    seed_backup_wal(&fx, WAL_A, WAL_B).await;

    let db = ScriptedDb::new(WAL_A, WAL_B);
    let outcome = run_backup(&fx.ctx, &db, None, BackupType::Full)
        .await
        .unwrap();
    assert_eq!(outcome.label.backup_type(), BackupType::Full);

    // the manifest's hashes match the live cluster
    let (_, storage) = fx.ctx.repo(1);
    let manifest = Manifest::load(storage, "main", &outcome.label, &fx.ctx.cancel)
        .await
        .unwrap();
    let originals = cluster_sha1s(&pg, &["PG_VERSION", "global/pg_control", "base/1/1259"]);
    for (file, sha1) in &originals {
        let entry = &manifest.files[&format!("pg_data/{file}")];
        assert_eq!(entry.checksum.as_deref(), Some(sha1.as_str()));
    }

    // restore into a fresh directory
    let restore_dir = fx.dir.path().join("restore");
    let mut config = fx.ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();

    let options = RestoreOptions {
        target: RecoveryTarget::default(),
        set: None,
        delta: false,
        selector: None,
        target_action: None,
        standby: false,
    };
    let result = run_restore(&restore_ctx, &options).await.unwrap();
    assert_eq!(result.label, outcome.label);

    // file-by-file SHA1 equality with the manifest set
    for (file, sha1) in &originals {
        let restored = std::fs::read(restore_dir.join(file)).unwrap();
        assert_eq!(&sha1_hex(&restored), sha1, "file {file} differs");
    }

    // recovery configuration hands replay to the database
    assert!(restore_dir.join("recovery.signal").exists());
    let auto_conf = std::fs::read_to_string(restore_dir.join("postgresql.auto.conf")).unwrap();
    assert!(auto_conf.contains("restore_command"));
    assert!(auto_conf.contains("archive-get"));
    // the WAL directory exists and is empty
    assert!(restore_dir.join("pg_wal").is_dir());
    assert_eq!(
        std::fs::read_dir(restore_dir.join("pg_wal")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn incremental_references_unchanged_files() {
    let fx = Fixture::new(1).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");
    write_cluster_file(&pg, "base/1/1259", &vec![0x10u8; 8192]);
    write_cluster_file(&pg, "base/1/2619", &vec![0x20u8; 8192]);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;

    let db = ScriptedDb::new(WAL_A, WAL_A);
    let full = run_backup(&fx.ctx, &db, None, BackupType::Full)
        .await
        .unwrap();

    // touch one file: new content and a different mtime
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_cluster_file(&pg, "base/1/2619", &vec![0x21u8; 8192]);

    let incr = run_backup(&fx.ctx, &db, None, BackupType::Incr)
        .await
        .unwrap();
    assert_eq!(incr.label.backup_type(), BackupType::Incr);

    let (_, storage) = fx.ctx.repo(1);
    let manifest = Manifest::load(storage, "main", &incr.label, &fx.ctx.cancel)
        .await
        .unwrap();

    // 2 of 3 entries reference the full; only the modified file is stored
    let referenced: Vec<&str> = manifest
        .files
        .iter()
        .filter(|(_, e)| e.reference.as_ref() == Some(&full.label))
        .map(|(p, _)| p.as_str())
        .collect();
    assert_eq!(referenced.len(), 2);
    assert!(referenced.contains(&"pg_data/PG_VERSION"));
    assert!(referenced.contains(&"pg_data/base/1/1259"));
    assert!(manifest.files["pg_data/base/1/2619"].reference.is_none());

    // only the modified file's object exists under the incremental label
    let incr_dir = walvault::archive::backup_path("main").join(incr.label.as_str());
    let entries = storage
        .list(
            Some(&incr_dir),
            repo_storage::InfoLevel::Exists,
            true,
            None,
            &fx.ctx.cancel,
        )
        .await
        .unwrap();
    let stored: Vec<&str> = entries
        .iter()
        .filter(|e| e.info.kind == repo_storage::ObjectKind::File)
        .filter_map(|e| e.path.object_name())
        .filter(|n| !n.starts_with("manifest"))
        .collect();
    assert_eq!(stored, vec!["2619"]);

    // restoring the incremental yields the same cluster as the live one
    let restore_dir = fx.dir.path().join("restore");
    let mut config = fx.ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();
    run_restore(
        &restore_ctx,
        &RestoreOptions {
            target: RecoveryTarget::default(),
            set: None,
            delta: false,
            selector: None,
            target_action: None,
            standby: false,
        },
    )
    .await
    .unwrap();

    for file in ["PG_VERSION", "base/1/1259", "base/1/2619"] {
        assert_eq!(
            std::fs::read(restore_dir.join(file)).unwrap(),
            std::fs::read(pg.join(file)).unwrap(),
            "file {file} differs"
        );
    }
}

#[tokio::test]
async fn block_incremental_stores_only_changed_blocks() {
    let fx = Fixture::new(1).await;
    let mut config = fx.ctx.config.clone();
    config.block_incr = true;
    let ctx: Arc<Context> = Context::new(config).await.unwrap();

    let pg = fx.pg_path();
    // two blocks at the default block size
    let block = walvault::backup::block_incr::BLOCK_SIZE_DEFAULT;
    let mut content = vec![0x0Au8; block * 2];
    write_cluster_file(&pg, "base/1/16400", &content);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;

    let db = ScriptedDb::new(WAL_A, WAL_A);
    run_backup(&ctx, &db, None, BackupType::Full).await.unwrap();

    std::thread::sleep(std::time::Duration::from_millis(1100));
    content[block + 7] = 0xFF; // dirty the second block only
    write_cluster_file(&pg, "base/1/16400", &content);

    let incr = run_backup(&ctx, &db, None, BackupType::Incr).await.unwrap();
    let (_, storage) = ctx.repo(1);
    let manifest = Manifest::load(storage, "main", &incr.label, &ctx.cancel)
        .await
        .unwrap();
    let entry = &manifest.files["pg_data/base/1/16400"];
    let map = entry.block_incr.as_ref().expect("block map present");
    assert_eq!(map.changed, vec![1]);
    // the stored object holds one block, not two
    assert_eq!(entry.repo_size, block as u64);

    // restore reassembles base blocks and the delta
    let restore_dir = fx.dir.path().join("restore");
    let mut config = ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();
    run_restore(
        &restore_ctx,
        &RestoreOptions {
            target: RecoveryTarget::default(),
            set: None,
            delta: false,
            selector: None,
            target_action: None,
            standby: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(
        std::fs::read(restore_dir.join("base/1/16400")).unwrap(),
        content
    );
}

#[tokio::test]
async fn resolver_picks_backup_by_target_time() {
    let fx = Fixture::new(1).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");

    let db1 = ScriptedDb::new(WAL_A, WAL_A);
    let db2 = ScriptedDb::new(WAL_B, WAL_B);
    let db3 = ScriptedDb::new(WAL_C, WAL_C);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;
    seed_backup_wal(&fx, WAL_B, WAL_B).await;
    seed_backup_wal(&fx, WAL_C, WAL_C).await;

    let b1 = run_backup(&fx.ctx, &db1, None, BackupType::Full)
        .await
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let b2 = run_backup(&fx.ctx, &db2, None, BackupType::Full)
        .await
        .unwrap();
    let between = chrono::Utc::now();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let b3 = run_backup(&fx.ctx, &db3, None, BackupType::Full)
        .await
        .unwrap();
    assert!(b1.label < b2.label && b2.label < b3.label);

    let target = RecoveryTarget {
        target: TargetType::Time(between),
        inclusive: true,
        timeline: None,
    };
    let resolved = resolver::resolve(&fx.ctx, &target, None).await.unwrap();
    assert_eq!(resolved.entry.label, b2.label);
    assert_eq!(resolved.wal_start, WAL_B);
}

#[tokio::test]
async fn resolver_fails_over_to_the_repo_with_complete_wal() {
    let fx = Fixture::new(2).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");

    // WAL present on both repos during the backup...
    seed_backup_wal(&fx, WAL_A, WAL_A).await;
    let db = ScriptedDb::new(WAL_A, WAL_A);
    let backup = run_backup(&fx.ctx, &db, None, BackupType::Full)
        .await
        .unwrap();

    // ...but later lost from repo1
    let (_, repo1) = fx.ctx.repo(1);
    let segment: pg_wal::WalSegment = WAL_A.parse().unwrap();
    let log_dir = walvault::archive::wal_log_path("main", "16-1", &segment);
    repo1.remove_prefix(&log_dir, &fx.ctx.cancel).await.unwrap();

    let resolved = resolver::resolve(&fx.ctx, &RecoveryTarget::default(), None)
        .await
        .unwrap();
    assert_eq!(resolved.entry.label, backup.label);
    assert_eq!(resolved.repo_index, 2);
}

#[tokio::test]
async fn selective_restore_zeroes_unselected_relations() {
    let fx = Fixture::new(1).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");
    write_cluster_file(&pg, "base/16384/16400", &vec![0x01u8; 4096]);
    write_cluster_file(&pg, "base/16500/16401", &vec![0x02u8; 4096]);
    write_cluster_file(&pg, "base/16500/1259", &vec![0x03u8; 4096]);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;

    let db = ScriptedDb::new(WAL_A, WAL_A);
    run_backup(&fx.ctx, &db, None, BackupType::Full)
        .await
        .unwrap();

    let restore_dir = fx.dir.path().join("restore");
    let mut config = fx.ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();
    run_restore(
        &restore_ctx,
        &RestoreOptions {
            target: RecoveryTarget::default(),
            set: None,
            delta: false,
            selector: Some(
                walvault::restore::filter::RestoreSelector::parse("16384\n").unwrap(),
            ),
            target_action: None,
            standby: false,
        },
    )
    .await
    .unwrap();

    // selected database restored in full
    assert_eq!(
        std::fs::read(restore_dir.join("base/16384/16400")).unwrap(),
        vec![0x01u8; 4096]
    );
    // unselected user table zeroed out
    assert_eq!(
        std::fs::read(restore_dir.join("base/16500/16401"))
            .unwrap()
            .len(),
        0
    );
    // system table of the unselected database restored in full
    assert_eq!(
        std::fs::read(restore_dir.join("base/16500/1259")).unwrap(),
        vec![0x03u8; 4096]
    );
}

#[tokio::test]
async fn bundled_backup_restores_via_ranged_reads() {
    let fx = Fixture::new(1).await;
    let mut config = fx.ctx.config.clone();
    config.repos[0].bundle = Some(repo_storage::bundle::BundleLimits {
        bundle_size: 4096,
        bundle_limit: 1024,
    });
    let ctx = Context::new(config).await.unwrap();

    let pg = fx.pg_path();
    // three small files that bundle, one large file that stays standalone
    write_cluster_file(&pg, "PG_VERSION", b"16\n");
    write_cluster_file(&pg, "pg_hba.conf", &vec![0x30u8; 200]);
    write_cluster_file(&pg, "postgresql.conf", &vec![0x31u8; 300]);
    write_cluster_file(&pg, "base/1/1259", &vec![0x32u8; 8192]);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;

    let db = ScriptedDb::new(WAL_A, WAL_A);
    let outcome = run_backup(&ctx, &db, None, BackupType::Full).await.unwrap();

    let (_, storage) = ctx.repo(1);
    let manifest = Manifest::load(storage, "main", &outcome.label, &ctx.cancel)
        .await
        .unwrap();

    // small files carry bundle references, the large one does not
    assert!(manifest.files["pg_data/PG_VERSION"].bundle.is_some());
    assert!(manifest.files["pg_data/pg_hba.conf"].bundle.is_some());
    assert!(manifest.files["pg_data/base/1/1259"].bundle.is_none());

    // no standalone objects exist for bundled files
    let label_dir = walvault::archive::backup_path("main").join(outcome.label.as_str());
    let entries = storage
        .list(
            Some(&label_dir),
            repo_storage::InfoLevel::Exists,
            true,
            None,
            &ctx.cancel,
        )
        .await
        .unwrap();
    assert!(!entries
        .iter()
        .any(|e| e.path.get_path().as_str().ends_with("PG_VERSION")));
    assert!(entries
        .iter()
        .any(|e| e.path.get_path().as_str().contains("/bundle/")));

    // restore reads bundled files back through ranged reads
    let restore_dir = fx.dir.path().join("restore");
    let mut config = ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();
    run_restore(
        &restore_ctx,
        &RestoreOptions {
            target: RecoveryTarget::default(),
            set: None,
            delta: false,
            selector: None,
            target_action: None,
            standby: false,
        },
    )
    .await
    .unwrap();

    for (file, len) in [
        ("PG_VERSION", 3usize),
        ("pg_hba.conf", 200),
        ("postgresql.conf", 300),
        ("base/1/1259", 8192),
    ] {
        assert_eq!(
            std::fs::read(restore_dir.join(file)).unwrap(),
            std::fs::read(pg.join(file)).unwrap(),
            "file {file} differs"
        );
        assert_eq!(std::fs::read(restore_dir.join(file)).unwrap().len(), len);
    }
}

#[tokio::test]
async fn delta_restore_skips_matching_files() {
    let fx = Fixture::new(1).await;
    let pg = fx.pg_path();
    write_cluster_file(&pg, "PG_VERSION", b"16\n");
    write_cluster_file(&pg, "base/1/1259", &vec![0x07u8; 8192]);
    seed_backup_wal(&fx, WAL_A, WAL_A).await;

    let db = ScriptedDb::new(WAL_A, WAL_A);
    run_backup(&fx.ctx, &db, None, BackupType::Full)
        .await
        .unwrap();

    // first restore into an empty dir, then again with --delta
    let restore_dir = fx.dir.path().join("restore");
    let mut config = fx.ctx.config.clone();
    config.pg_path = restore_dir.clone();
    let restore_ctx = Context::new(config).await.unwrap();
    let options = |delta| RestoreOptions {
        target: RecoveryTarget::default(),
        set: None,
        delta,
        selector: None,
        target_action: None,
        standby: false,
    };

    let first = run_restore(&restore_ctx, &options(false)).await.unwrap();
    assert_eq!(first.files_skipped, 0);

    let second = run_restore(&restore_ctx, &options(true)).await.unwrap();
    assert!(second.files_skipped >= 2, "unchanged files are skipped");
}
