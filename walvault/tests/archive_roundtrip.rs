//! End-to-end archive scenarios over posix repositories.

mod common;

use common::*;
use walvault::archive::get::{fetch_wal_file, get_async, serve_from_spool, Found};
use walvault::archive::push::{push_async, push_file};
use walvault::archive::spool::{Spool, Status};
use walvault::errors::Error;

#[tokio::test]
async fn async_push_happy_path() {
    let fx = Fixture::new(1).await;
    let seg1 = "000000010000000100000001";
    let seg2 = "000000010000000100000002";
    let bytes1 = fx.craft_segment(seg1, 0xAA);
    let bytes2 = fx.craft_segment(seg2, 0xBB);

    let spool = Spool::new(&fx.ctx.config.spool_path, "main").unwrap();
    let processed = push_async(fx.ctx.clone(), &spool).await.unwrap();
    assert_eq!(processed, 2);

    // both segments have an .ok and no .error
    for seg in [seg1, seg2] {
        assert!(matches!(
            spool.status(spool.out_dir(), seg).unwrap(),
            Some(Status::Ok { .. })
        ));
    }

    // repository objects carry the content hash in their names
    let (_, storage) = fx.ctx.repo(1);
    for (seg, bytes) in [(seg1, &bytes1), (seg2, &bytes2)] {
        let segment = seg.parse().unwrap();
        let found = walvault::archive::wal_segment_find(
            storage,
            "main",
            "16-1",
            &segment,
            &fx.ctx.cancel,
        )
        .await
        .unwrap()
        .expect("segment object exists");
        assert_eq!(found, format!("{seg}-{}", sha1_hex(bytes)));
    }
}

#[tokio::test]
async fn push_then_get_roundtrip_is_byte_identical() {
    let fx = Fixture::new(1).await;
    let seg = "000000010000000100000003";
    let bytes = fx.craft_segment(seg, 0xCD);

    push_file(&fx.ctx, &fx.wal_dir().join(seg)).await.unwrap();

    match fetch_wal_file(&fx.ctx, seg).await.unwrap() {
        Found::Yes {
            bytes: fetched,
            warnings,
        } => {
            assert_eq!(fetched, bytes);
            assert!(warnings.is_empty());
        }
        Found::No { .. } => panic!("pushed segment must be found"),
    }
}

#[tokio::test]
async fn duplicate_push_same_content_warns_and_leaves_one_object() {
    let fx = Fixture::new(1).await;
    let seg = "000000010000000100000004";
    fx.craft_segment(seg, 0x11);

    let first = push_file(&fx.ctx, &fx.wal_dir().join(seg)).await.unwrap();
    assert!(first.warnings.is_empty());

    let second = push_file(&fx.ctx, &fx.wal_dir().join(seg)).await.unwrap();
    assert_eq!(second.warnings.len(), 1);
    assert!(second.warnings[0].contains("already exists"));
    assert!(second.warnings[0].contains("same checksum"));

    // exactly one object remains
    let (_, storage) = fx.ctx.repo(1);
    let segment = seg.parse().unwrap();
    walvault::archive::wal_segment_find(storage, "main", "16-1", &segment, &fx.ctx.cancel)
        .await
        .unwrap()
        .expect("exactly one object");
}

#[tokio::test]
async fn duplicate_push_differing_content_is_a_hard_error() {
    let fx = Fixture::new(1).await;
    let seg = "000000010000000100000005";
    fx.craft_segment(seg, 0x22);
    push_file(&fx.ctx, &fx.wal_dir().join(seg)).await.unwrap();

    // same name, different payload
    fx.craft_segment(seg, 0x33);
    let err = push_file(&fx.ctx, &fx.wal_dir().join(seg))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ArchiveDuplicate(_)));
}

#[tokio::test]
async fn header_mismatch_is_an_archive_mismatch() {
    let fx = Fixture::new(1).await;
    let seg = "000000010000000100000006";
    fx.craft_segment(seg, 0x44);

    // corrupt the system id in the long header
    let path = fx.wal_dir().join(seg);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[24] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let err = push_file(&fx.ctx, &path).await.unwrap_err();
    assert!(matches!(err, Error::ArchiveMismatch(_)));
}

#[tokio::test]
async fn multi_repo_get_fails_over_with_a_warning() {
    let fx = Fixture::new(2).await;
    let seg = "000000010000000100000007";
    let good = craft_segment_bytes(seg, 0x55);

    // repo1 holds an object whose name promises a hash its content fails;
    // repo2 holds a valid copy
    let mut corrupt = good.clone();
    corrupt[4096] ^= 0xFF;
    let (_, repo1) = fx.ctx.repo(1);
    let segment: pg_wal::WalSegment = seg.parse().unwrap();
    let bad_path =
        walvault::archive::wal_segment_path("main", "16-1", &segment, &sha1_hex(&good), None);
    repo1
        .write_bytes(&bad_path, bytes::Bytes::from(corrupt), &fx.ctx.cancel)
        .await
        .unwrap();
    fx.seed_archived_segment(2, seg, &good).await;

    match fetch_wal_file(&fx.ctx, seg).await.unwrap() {
        Found::Yes { bytes, warnings } => {
            assert_eq!(bytes, good);
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].contains("repo1"));
        }
        Found::No { .. } => panic!("repo2 has a valid copy"),
    }
}

#[tokio::test]
async fn prefetch_stages_segments_and_records_missing_ones() {
    let fx = Fixture::new(1).await;
    let seg1 = "000000010000000100000008";
    let bytes1 = craft_segment_bytes(seg1, 0x66);
    fx.seed_archived_segment(1, seg1, &bytes1).await;
    // the successor is not archived

    let spool = Spool::new(&fx.ctx.config.spool_path, "main").unwrap();
    let current = seg1.parse().unwrap();
    get_async(fx.ctx.clone(), &spool, &current).await.unwrap();

    // seg1 is staged with an .ok
    assert!(spool.staged(seg1).exists());
    assert!(matches!(
        spool.status(spool.in_dir(), seg1).unwrap(),
        Some(Status::Ok { .. })
    ));

    // the missing successor got an .ok with no staged file
    let seg2 = "000000010000000100000009";
    assert!(!spool.staged(seg2).exists());
    assert!(matches!(
        spool.status(spool.in_dir(), seg2).unwrap(),
        Some(Status::Ok { .. })
    ));

    // serving consumes the staged segment
    let dest = fx.dir.path().join("delivered");
    assert_eq!(serve_from_spool(&spool, seg1, &dest).unwrap(), Some(true));
    assert_eq!(std::fs::read(&dest).unwrap(), bytes1);
    assert!(!spool.staged(seg1).exists());

    // the missing outcome serves as "not found"
    let dest2 = fx.dir.path().join("delivered2");
    assert_eq!(serve_from_spool(&spool, seg2, &dest2).unwrap(), Some(false));
    assert!(!dest2.exists());
}

#[tokio::test]
async fn filters_roundtrip_through_the_archive() {
    // gzip-compressed repository: push applies the stack, get reverses it
    let fx = Fixture::new(1).await;
    {
        // enable compression on the repo by rebuilding the context
        let mut config = fx.ctx.config.clone();
        config.repos[0].compress_type = repo_storage::filter::CompressType::Gzip;
        let ctx = walvault::Context::new(config).await.unwrap();

        let seg = "00000001000000010000000A";
        let bytes = fx.craft_segment(seg, 0x77);
        push_file(&ctx, &fx.wal_dir().join(seg)).await.unwrap();

        // the stored object carries the compression extension and is smaller
        let (_, storage) = ctx.repo(1);
        let segment = seg.parse().unwrap();
        let object =
            walvault::archive::wal_segment_find(storage, "main", "16-1", &segment, &ctx.cancel)
                .await
                .unwrap()
                .unwrap();
        assert!(object.ends_with(".gz"));

        match fetch_wal_file(&ctx, seg).await.unwrap() {
            Found::Yes { bytes: fetched, .. } => assert_eq!(fetched, bytes),
            Found::No { .. } => panic!("compressed segment must be found"),
        }
    }
}

#[tokio::test]
async fn encrypted_repo_roundtrip() {
    let fx = Fixture::new(1).await;
    let mut config = fx.ctx.config.clone();
    config.repos[0].cipher_type = repo_storage::filter::CipherType::Aes256Gcm;
    config.repos[0].cipher_key =
        Some(repo_storage::filter::CipherKey::from_hex(&"ab".repeat(32)).unwrap());
    let ctx = walvault::Context::new(config).await.unwrap();

    let seg = "00000001000000010000000B";
    let bytes = fx.craft_segment(seg, 0x88);
    push_file(&ctx, &fx.wal_dir().join(seg)).await.unwrap();

    match fetch_wal_file(&ctx, seg).await.unwrap() {
        Found::Yes { bytes: fetched, .. } => assert_eq!(fetched, bytes),
        Found::No { .. } => panic!("encrypted segment must be found"),
    }
}

#[tokio::test]
async fn history_files_archive_verbatim() {
    let fx = Fixture::new(1).await;
    let name = "00000002.history";
    let contents = b"1\t0/5000000\tno recovery target specified\n";
    std::fs::write(fx.wal_dir().join(name), contents).unwrap();

    push_file(&fx.ctx, &fx.wal_dir().join(name)).await.unwrap();

    match fetch_wal_file(&fx.ctx, name).await.unwrap() {
        Found::Yes { bytes, .. } => assert_eq!(bytes, contents),
        Found::No { .. } => panic!("history file must be found"),
    }
}
