use std::sync::Arc;
use std::time::Duration;

use strata_types::{IndexId, RepositoryError, ShardId, SnapshotId};

use crate::config::RepositorySettings;
use crate::shard::{RecoveryState, ShardSnapshotStatus, Stage};
use crate::testutil::{completion_channel, memory_repository_with, MemShardStore};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn settings_with_chunk(chunk_size: i64) -> RepositorySettings {
    RepositorySettings {
        chunk_size: Some(chunk_size),
        // Keep unit tests fast; throttling has its own tests.
        max_snapshot_bytes_per_sec: 0,
        max_restore_bytes_per_sec: 0,
        ..Default::default()
    }
}

fn docs_index() -> IndexId {
    IndexId::new("docs", "d1")
}

fn snapshot_shard_blocking(
    repo: &Arc<crate::repository::BlobStoreRepository>,
    store: &Arc<MemShardStore>,
    snapshot: &SnapshotId,
    status: &Arc<ShardSnapshotStatus>,
) -> strata_types::Result<String> {
    let (completion, rx) = completion_channel();
    repo.snapshot_shard(
        Arc::clone(store) as Arc<dyn crate::shard::ShardStore>,
        store.commit(1),
        snapshot.clone(),
        docs_index(),
        Arc::clone(status),
        completion,
    );
    rx.recv_timeout(RECV_TIMEOUT).unwrap()
}

#[test]
fn fresh_shard_snapshot_writes_all_expected_blobs() {
    let (repo, blobs, _pool) = memory_repository_with("fresh", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 100]);
    store.put_file("b.fdt", vec![2u8; 5000]);

    let status = Arc::new(ShardSnapshotStatus::new());
    let generation =
        snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u1"), &status).unwrap();
    assert_eq!(generation, "0");

    let keys = blobs.keys();
    assert!(keys.contains(&"indices/d1/0/snap-u1.dat".to_string()));
    assert!(keys.contains(&"indices/d1/0/index-0".to_string()));

    // Two data blobs: a.si in one part, b.fdt split 4096 + 904.
    let data_blobs: Vec<&String> = keys
        .iter()
        .filter(|key| key.starts_with("indices/d1/0/__"))
        .collect();
    assert_eq!(data_blobs.len(), 3);
    let part0 = data_blobs.iter().find(|key| key.ends_with(".part0")).unwrap();
    let part1 = data_blobs.iter().find(|key| key.ends_with(".part1")).unwrap();
    assert_eq!(blobs.blob(part0).unwrap().len(), 4096);
    assert_eq!(blobs.blob(part1).unwrap().len(), 904);

    let summary = status.summary();
    assert_eq!(summary.stage, Stage::Done);
    assert_eq!(summary.incremental_file_count, 2);
    assert_eq!(summary.total_file_count, 2);
    assert_eq!(summary.incremental_size, 5100);
    assert_eq!(summary.processed_size, 5100);
    assert_eq!(summary.generation, Some(0));

    // Reference counts are balanced once the snapshot completes.
    assert_eq!(store.ref_count(), 0);
}

#[test]
fn unchanged_files_are_deduplicated() {
    let (repo, blobs, _pool) = memory_repository_with("dedup", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 100]);
    store.put_file("b.fdt", vec![2u8; 5000]);

    let status1 = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u1"), &status1).unwrap();
    let blobs_before = blobs.keys().len();

    // Only b.fdt changes.
    store.put_file("b.fdt", vec![3u8; 6000]);
    let status2 = Arc::new(ShardSnapshotStatus::new());
    let generation =
        snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-2", "u2"), &status2).unwrap();
    assert_eq!(generation, "1");

    let summary = status2.summary();
    assert_eq!(summary.total_file_count, 2);
    assert_eq!(summary.incremental_file_count, 1);
    assert_eq!(summary.incremental_size, 6000);

    let keys = blobs.keys();
    assert!(keys.contains(&"indices/d1/0/index-1".to_string()));
    // Old catalog generation swept after the new one committed.
    assert!(!keys.contains(&"indices/d1/0/index-0".to_string()));
    // a.si produced no new data blob. Net growth: snap-u2.dat, two new
    // parts for b.fdt, index-1, minus the swept index-0.
    assert_eq!(keys.len() - blobs_before, 3);
}

#[test]
fn identical_commit_uploads_nothing() {
    let (repo, blobs, _pool) = memory_repository_with("noop", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 100]);

    let status1 = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u1"), &status1).unwrap();
    let data_blobs_before = blobs
        .keys()
        .iter()
        .filter(|key| key.contains("/__"))
        .count();

    let status2 = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-2", "u2"), &status2).unwrap();

    assert_eq!(status2.summary().incremental_file_count, 0);
    let data_blobs_after = blobs
        .keys()
        .iter()
        .filter(|key| key.contains("/__"))
        .count();
    assert_eq!(data_blobs_before, data_blobs_after);
}

#[test]
fn duplicate_snapshot_name_is_rejected() {
    let (repo, _blobs, _pool) = memory_repository_with("dupname", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 100]);

    let status1 = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u1"), &status1).unwrap();

    let status2 = Arc::new(ShardSnapshotStatus::new());
    let err = snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u2"), &status2)
        .unwrap_err();
    match err {
        RepositoryError::ShardSnapshotFailed { reason, .. } => {
            assert!(reason.contains("duplicate snapshot name"), "{reason}")
        }
        other => panic!("expected ShardSnapshotFailed, got {other:?}"),
    }
    assert_eq!(status2.summary().stage, Stage::Failed);
}

#[test]
fn abort_mid_upload_surfaces_and_leftovers_are_tolerated() {
    let (repo, blobs, _pool) = memory_repository_with("abort", settings_with_chunk(1024));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    // 13 parts of 1 KiB.
    store.put_file("c.fdt", vec![7u8; 13 * 1024]);

    let status = Arc::new(ShardSnapshotStatus::new());
    {
        // Flip the sticky abort flag once roughly half the file has been
        // read; the uploader polls it between parts.
        let status = Arc::clone(&status);
        store.set_read_hook(Box::new(move |total_read| {
            if total_read >= 6 * 1024 {
                status.abort();
            }
        }));
    }

    let err =
        snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-abort", "ua"), &status)
            .unwrap_err();
    assert!(matches!(err, RepositoryError::SnapshotAborted), "{err:?}");

    // Partial parts may remain; no commit point or catalog was written.
    let keys = blobs.keys();
    assert!(keys.iter().all(|key| !key.contains("snap-ua.dat")));
    assert!(keys.iter().all(|key| !key.contains("indices/d1/0/index-")));

    // The next snapshot attempt proceeds past the leftovers.
    store.set_read_hook(Box::new(|_| {}));
    let status2 = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-after", "ub"), &status2)
        .unwrap();
    assert_eq!(status2.summary().stage, Stage::Done);
}

#[test]
fn corrupted_local_file_marks_the_store() {
    let (repo, _blobs, _pool) = memory_repository_with("corrupt-store", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 256]);

    // Capture the commit metadata, then corrupt the bytes underneath it.
    let commit = store.commit(1);
    store.corrupt_file("a.si");

    let status = Arc::new(ShardSnapshotStatus::new());
    let (completion, rx) = completion_channel();
    repo.snapshot_shard(
        Arc::clone(&store) as Arc<dyn crate::shard::ShardStore>,
        commit,
        SnapshotId::new("snap-bad", "ub"),
        docs_index(),
        Arc::clone(&status),
        completion,
    );
    let err = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err();
    match &err {
        RepositoryError::ShardSnapshotFailed { reason, .. } => {
            assert!(reason.contains("checksum mismatch"), "{reason}")
        }
        other => panic!("expected ShardSnapshotFailed, got {other:?}"),
    }
    assert!(store.is_marked_corrupted());
}

#[test]
fn restore_streams_every_part_back() {
    let (repo, _blobs, _pool) = memory_repository_with("restore", settings_with_chunk(1024));
    let source = MemShardStore::new(ShardId::new("docs", 0));
    source.put_file("a.si", vec![1u8; 100]);
    source.put_file("b.fdt", (0..5000u64).map(|i| (i % 251) as u8).collect());

    let snapshot = SnapshotId::new("snap-1", "u1");
    let status = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &source, &snapshot, &status).unwrap();

    let target = MemShardStore::new(ShardId::new("docs", 0));
    let recovery = RecoveryState::new();
    repo.restore_shard(&*target, &snapshot, &docs_index(), 0, &recovery)
        .unwrap();

    assert_eq!(target.file("a.si"), source.file("a.si"));
    assert_eq!(target.file("b.fdt"), source.file("b.fdt"));
    assert_eq!(recovery.file_count(), 2);
    assert_eq!(recovery.total_bytes(), 5100);
    assert_eq!(recovery.recovered_bytes(), 5100);
}

#[test]
fn restore_of_missing_snapshot_fails_with_the_shard_context() {
    let (repo, _blobs, _pool) = memory_repository_with("restore-miss", settings_with_chunk(1024));
    let target = MemShardStore::new(ShardId::new("docs", 0));
    let recovery = RecoveryState::new();
    let err = repo
        .restore_shard(
            &*target,
            &SnapshotId::new("ghost", "ug"),
            &docs_index(),
            0,
            &recovery,
        )
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ShardRestoreFailed { .. }));
}

#[test]
fn shard_catalog_is_rebuilt_from_commit_points_when_missing() {
    use strata_storage::BlobStore;

    let (repo, blobs, _pool) = memory_repository_with("rebuild", settings_with_chunk(4096));
    let store = MemShardStore::new(ShardId::new("docs", 0));
    store.put_file("a.si", vec![1u8; 100]);

    let status = Arc::new(ShardSnapshotStatus::new());
    snapshot_shard_blocking(&repo, &store, &SnapshotId::new("snap-1", "u1"), &status).unwrap();

    // Lose the catalog blob. A full shard listing still reconstructs the
    // catalog from the surviving commit point (single-writer recovery).
    blobs.delete_blob("indices/d1/0/index-0").unwrap();
    let container = repo.shard_container(&docs_index(), 0).unwrap();
    let names: Vec<String> = container.list_blobs().unwrap().into_keys().collect();
    let (rebuilt, generation) = repo.build_shard_snapshots(&container, &names);

    assert_eq!(generation, -1);
    assert!(rebuilt.has_snapshot("snap-1"));
    assert!(rebuilt.find_physical("a.si").len() == 1);
}
