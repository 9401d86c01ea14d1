//! Prefetch planning for asynchronous archive-get.

use pg_wal::{PgVersion, WalSegment};

use super::spool::Spool;
use crate::errors::Result;

/// Segments the async worker should fetch, given the segment the database
/// just asked for.
///
/// The queue budget is `queue_max / segment_size` segments, never less than
/// two once async is on (fetching only the current segment would leave the
/// database waiting on every call). Segments already staged in the spool and
/// segments with a prior `.ok`/`.error` are excluded.
pub fn queue_need(
    current: &WalSegment,
    current_found: bool,
    queue_max: u64,
    segment_size: usize,
    version: PgVersion,
    spool: &Spool,
) -> Result<Vec<WalSegment>> {
    let budget = (queue_max / segment_size as u64).max(2) as usize;

    let first = if current_found {
        current.next(segment_size, version)
    } else {
        *current
    };

    let mut need = Vec::new();
    for candidate in first.range(budget, segment_size, version) {
        let name = candidate.to_string();
        if spool.staged(&name).exists() {
            continue;
        }
        if spool.status(spool.in_dir(), &name)?.is_some() {
            continue;
        }
        need.push(candidate);
    }
    Ok(need)
}

/// Whether prefetch is enabled at all: a zero queue disables it.
pub fn prefetch_enabled(queue_max: u64) -> bool {
    queue_max > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_wal::WAL_SEGMENT_SIZE_DEFAULT;

    const V96: PgVersion = PgVersion(90600);
    const V92: PgVersion = PgVersion(90200);

    fn spool() -> (camino_tempfile::Utf8TempDir, Spool) {
        let dir = camino_tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), "main").unwrap();
        (dir, spool)
    }

    #[test]
    fn queue_starts_at_current_when_missing() {
        let (_dir, spool) = spool();
        let current: WalSegment = "000000010000000100000001".parse().unwrap();

        let need = queue_need(
            &current,
            false,
            4 * WAL_SEGMENT_SIZE_DEFAULT as u64,
            WAL_SEGMENT_SIZE_DEFAULT,
            V96,
            &spool,
        )
        .unwrap();

        let names: Vec<String> = need.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "000000010000000100000001",
                "000000010000000100000002",
                "000000010000000100000003",
                "000000010000000100000004",
            ]
        );
    }

    #[test]
    fn queue_starts_after_current_when_found() {
        let (_dir, spool) = spool();
        let current: WalSegment = "000000010000000100000001".parse().unwrap();

        let need = queue_need(
            &current,
            true,
            2 * WAL_SEGMENT_SIZE_DEFAULT as u64,
            WAL_SEGMENT_SIZE_DEFAULT,
            V96,
            &spool,
        )
        .unwrap();
        assert_eq!(need[0].to_string(), "000000010000000100000002");
    }

    #[test]
    fn queue_budget_is_at_least_two() {
        let (_dir, spool) = spool();
        let current: WalSegment = "000000010000000100000001".parse().unwrap();

        // queue_max of zero bytes still asks for two segments once async is on
        let need = queue_need(&current, false, 0, WAL_SEGMENT_SIZE_DEFAULT, V96, &spool).unwrap();
        assert_eq!(need.len(), 2);
    }

    #[test]
    fn staged_and_statused_segments_are_skipped() {
        let (_dir, spool) = spool();
        std::fs::write(spool.staged("000000010000000100000002"), b"wal").unwrap();
        spool
            .write_status(
                &spool.in_dir().to_path_buf(),
                "000000010000000100000003",
                &super::super::spool::Status::Ok {
                    warnings: Vec::new(),
                },
            )
            .unwrap();

        let current: WalSegment = "000000010000000100000001".parse().unwrap();
        let need = queue_need(
            &current,
            false,
            4 * WAL_SEGMENT_SIZE_DEFAULT as u64,
            WAL_SEGMENT_SIZE_DEFAULT,
            V96,
            &spool,
        )
        .unwrap();

        let names: Vec<String> = need.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            vec!["000000010000000100000001", "000000010000000100000004"]
        );
    }

    #[test]
    fn pre_93_skips_the_ff_segment() {
        let (_dir, spool) = spool();
        let current: WalSegment = "0000000100000001000000FE".parse().unwrap();

        let need = queue_need(
            &current,
            true,
            2 * WAL_SEGMENT_SIZE_DEFAULT as u64,
            WAL_SEGMENT_SIZE_DEFAULT,
            V92,
            &spool,
        )
        .unwrap();
        assert_eq!(need[0].to_string(), "000000010000000200000000");

        // from 9.3 on the FF segment exists
        let need = queue_need(
            &current,
            true,
            2 * WAL_SEGMENT_SIZE_DEFAULT as u64,
            WAL_SEGMENT_SIZE_DEFAULT,
            V96,
            &spool,
        )
        .unwrap();
        assert_eq!(need[0].to_string(), "0000000100000001000000FF");
    }
}
