use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use strata_storage::BlobContainer;
use strata_types::{random_uuid, IndexId, RepositoryError, Result, ShardId, SnapshotId};

use crate::exec::{Completion, GroupedCompletion, Step};
use crate::shard::file_info::DATA_BLOB_PREFIX;
use crate::shard::{
    FileInfo, ShardCommit, ShardSnapshot, ShardSnapshotStatus, ShardSnapshots, ShardStore,
};
use crate::stream::AbortableRead;
use crate::throttle::RateLimitedRead;

use super::{BlobStoreRepository, INDEX_FILE_PREFIX};

/// Inputs of one shard snapshot attempt after the planning phase.
struct ShardSnapshotPlan {
    container: BlobContainer,
    snapshots: ShardSnapshots,
    generation: i64,
    /// index-N blobs present before this attempt, deleted after commit.
    stale_index_blobs: Vec<String>,
    commit_files: Vec<FileInfo>,
    files_to_snapshot: Vec<FileInfo>,
}

impl BlobStoreRepository {
    /// Snapshot one shard: diff the commit against the shard catalog,
    /// upload the new data blobs, write the commit point, and advance the
    /// shard catalog generation. Completes with the new generation.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot_shard(
        self: &Arc<Self>,
        store: Arc<dyn ShardStore>,
        commit: ShardCommit,
        snapshot_id: SnapshotId,
        index_id: IndexId,
        status: Arc<ShardSnapshotStatus>,
        completion: Completion<String>,
    ) {
        let shard_id = store.shard_id();
        debug!(shard = %shard_id, snapshot = %snapshot_id, repository = %self.name, "snapshotting shard");

        let done: Step<String> = Step::new();
        {
            let status = Arc::clone(&status);
            let shard_id = shard_id.clone();
            done.when_complete(Box::new(move |result| match result {
                Ok(generation) => completion(Ok(generation)),
                Err(e) => {
                    status.move_to_failed(Utc::now(), e.to_string());
                    completion(Err(wrap_shard_failure(&shard_id, e)));
                }
            }));
        }

        let plan = match self.plan_shard_snapshot(&store, &commit, &snapshot_id, &index_id, &status)
        {
            Ok(plan) => plan,
            Err(e) => {
                done.complete(Err(e));
                return;
            }
        };

        if plan.files_to_snapshot.is_empty() {
            let result = self.finalize_shard_snapshot(&snapshot_id, &status, plan);
            done.complete(result);
            return;
        }

        // Fan the uploads out; the single fan-in join orders the commit
        // point strictly after every part write. A failed upload flips the
        // shared flag so queued uploads stop before they start, while
        // in-flight ones drain on their own.
        let already_failed = Arc::new(AtomicBool::new(false));
        let mut plan = plan;
        let files = std::mem::take(&mut plan.files_to_snapshot);
        let uploads = GroupedCompletion::<()>::new(files.len(), {
            let repo = Arc::clone(self);
            let snapshot_id = snapshot_id.clone();
            let status = Arc::clone(&status);
            let done = done.clone();
            Box::new(move |result| match result {
                Ok(_) => {
                    let finalized = repo.finalize_shard_snapshot(&snapshot_id, &status, plan);
                    done.complete(finalized);
                }
                Err(e) => done.complete(Err(e)),
            })
        });

        for file in files {
            let repo = Arc::clone(self);
            let store = Arc::clone(&store);
            let status = Arc::clone(&status);
            let uploads = uploads.clone();
            let already_failed = Arc::clone(&already_failed);
            let snapshot_id = snapshot_id.clone();
            let index_id = index_id.clone();
            let shard_id = shard_id.clone();
            self.pool().spawn_snapshot(move || {
                if already_failed.load(Ordering::Acquire) {
                    // Another upload already failed; count this slot
                    // without starting more transfers.
                    uploads.on_response(());
                    return;
                }
                match repo.snapshot_file(&*store, &file, &index_id, &shard_id, &snapshot_id, &status)
                {
                    Ok(()) => uploads.on_response(()),
                    Err(e) => {
                        already_failed.store(true, Ordering::Release);
                        uploads.on_failure(e);
                    }
                }
            });
        }
    }

    fn plan_shard_snapshot(
        &self,
        store: &Arc<dyn ShardStore>,
        commit: &ShardCommit,
        snapshot_id: &SnapshotId,
        index_id: &IndexId,
        status: &ShardSnapshotStatus,
    ) -> Result<ShardSnapshotPlan> {
        let shard_id = store.shard_id();
        let container = self.shard_container(index_id, shard_id.shard())?;

        let blobs = container
            .list_blobs_by_prefix(INDEX_FILE_PREFIX)
            .map_err(|e| RepositoryError::ShardSnapshotFailed {
                shard: shard_id.clone(),
                reason: format!("failed to list blobs: {e}"),
            })?;
        let blob_names: Vec<String> = blobs.keys().cloned().collect();
        let (snapshots, generation) = self.build_shard_snapshots(&container, &blob_names);

        if snapshots.has_snapshot(snapshot_id.name()) {
            return Err(RepositoryError::ShardSnapshotFailed {
                shard: shard_id.clone(),
                reason: format!(
                    "duplicate snapshot name [{}] detected, aborting",
                    snapshot_id.name()
                ),
            });
        }

        store.inc_ref();
        let diff = self.diff_commit_files(commit, &snapshots, status);
        store.dec_ref();
        let (commit_files, files_to_snapshot, counters) = diff?;

        status.move_to_started(
            Utc::now(),
            counters.incremental_file_count,
            counters.total_file_count,
            counters.incremental_size,
            counters.total_size,
        )?;

        Ok(ShardSnapshotPlan {
            container,
            snapshots,
            generation,
            stale_index_blobs: blob_names,
            commit_files,
            files_to_snapshot,
        })
    }

    fn diff_commit_files(
        &self,
        commit: &ShardCommit,
        snapshots: &ShardSnapshots,
        status: &ShardSnapshotStatus,
    ) -> Result<(Vec<FileInfo>, Vec<FileInfo>, DiffCounters)> {
        let mut commit_files = Vec::with_capacity(commit.files.len());
        let mut files_to_snapshot = Vec::new();
        let mut counters = DiffCounters::default();

        for metadata in &commit.files {
            if status.is_aborted() {
                debug!(file = %metadata.name, "aborted while planning, exiting");
                return Err(RepositoryError::SnapshotAborted);
            }

            let existing = snapshots
                .find_physical(&metadata.name)
                .into_iter()
                .find(|info| info.is_same(metadata))
                .cloned();

            counters.total_file_count += 1;
            counters.total_size += metadata.length;

            match existing {
                // Same name, length, and checksum already in the
                // repository: reference it instead of re-uploading.
                Some(info) => commit_files.push(info),
                None => {
                    counters.incremental_file_count += 1;
                    counters.incremental_size += metadata.length;
                    let info = FileInfo::new(
                        format!("{DATA_BLOB_PREFIX}{}", random_uuid()),
                        metadata,
                        self.settings().effective_chunk_size(),
                    );
                    commit_files.push(info.clone());
                    files_to_snapshot.push(info);
                }
            }
        }
        Ok((commit_files, files_to_snapshot, counters))
    }

    /// Upload one file as `ceil(length / chunk)` parts, verifying the
    /// local bytes and honoring the abort flag between reads.
    fn snapshot_file(
        &self,
        store: &dyn ShardStore,
        file: &FileInfo,
        index_id: &IndexId,
        shard_id: &ShardId,
        snapshot_id: &SnapshotId,
        status: &ShardSnapshotStatus,
    ) -> Result<()> {
        let container = self.shard_container(index_id, shard_id.shard())?;
        store.inc_ref();
        let guard = RefGuard(store);

        let result = (|| -> Result<()> {
            let mut input = store.open_verifying_input(&file.metadata())?;
            for part in 0..file.number_of_parts() {
                if status.is_aborted() {
                    debug!(shard = %shard_id, snapshot = %snapshot_id, file = %file.physical_name(),
                           "aborted on the file, exiting");
                    return Err(RepositoryError::SnapshotAborted);
                }
                let part_bytes = file.part_bytes(part);
                let limited = RateLimitedRead::new(
                    (&mut input).take(part_bytes),
                    self.snapshot_throttle(),
                    self.snapshot_throttle_counter(),
                );
                let mut abortable = AbortableRead::new(limited, {
                    let status = status;
                    move || {
                        status
                            .is_aborted()
                            .then(|| std::io::Error::other("snapshot aborted"))
                    }
                });
                container
                    .write_blob(&file.part_name(part), &mut abortable, part_bytes, true)
                    .map_err(|e| {
                        if status.is_aborted() {
                            RepositoryError::SnapshotAborted
                        } else {
                            e
                        }
                    })?;
            }
            input.verify()?;
            status.add_processed_size(file.length());
            Ok(())
        })();

        drop(guard);
        if let Err(e) = &result {
            if e.is_corruption() {
                store.mark_corrupted(&e.to_string());
            }
        }
        result
    }

    /// Write the commit point and advance the shard catalog; runs only
    /// after every upload has drained.
    fn finalize_shard_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        status: &ShardSnapshotStatus,
        plan: ShardSnapshotPlan,
    ) -> Result<String> {
        let summary = status.move_to_finalize()?;
        let now = Utc::now();
        let shard_snapshot = ShardSnapshot::new(
            snapshot_id.name(),
            plan.commit_files,
            summary.start_time.unwrap_or(now),
            now,
            summary.incremental_file_count,
            summary.incremental_size,
        );

        debug!(snapshot = %snapshot_id, "writing shard commit point");
        // Idempotent on coordinator failover: a pre-existing commit point
        // for this UUID is the same commit point.
        self.shard_snapshot_format()
            .write(&shard_snapshot, &plan.container, snapshot_id.uuid(), false)
            .map_err(|e| self.error(&format!("failed to write commit point: {e}")))?;

        let new_generation = plan.generation + 1;
        let updated = plan
            .snapshots
            .with_commit_point(shard_snapshot.into_snapshot_files());
        self.shard_snapshots_format()
            .write_atomic(&updated, &plan.container, &new_generation.to_string(), true)
            .map_err(|e| {
                self.error(&format!(
                    "failed to finalize snapshot creation [{snapshot_id}] with shard index [index-{new_generation}]: {e}"
                ))
            })?;

        let stale: Vec<String> = plan
            .stale_index_blobs
            .iter()
            .filter(|name| name.starts_with(INDEX_FILE_PREFIX))
            .cloned()
            .collect();
        debug_assert!(
            stale
                .iter()
                .filter_map(|name| name[INDEX_FILE_PREFIX.len()..].parse::<i64>().ok())
                .all(|gen| gen < new_generation),
            "tried to delete a shard catalog blob newer than the committed generation"
        );
        if let Err(e) = plan.container.delete_blobs_ignoring_if_not_exists(&stale) {
            warn!(snapshot = %snapshot_id, error = %e,
                  "failed to delete old shard catalog blobs during finalization");
        }

        status.move_to_done(Utc::now(), new_generation);
        Ok(new_generation.to_string())
    }
}

#[derive(Default)]
struct DiffCounters {
    incremental_file_count: u64,
    total_file_count: u64,
    incremental_size: u64,
    total_size: u64,
}

fn wrap_shard_failure(shard_id: &ShardId, err: RepositoryError) -> RepositoryError {
    match err {
        e @ (RepositoryError::SnapshotAborted
        | RepositoryError::ShardSnapshotFailed { .. }
        | RepositoryError::ConcurrentModification { .. }) => e,
        other => RepositoryError::ShardSnapshotFailed {
            shard: shard_id.clone(),
            reason: other.to_string(),
        },
    }
}

struct RefGuard<'a>(&'a dyn ShardStore);

impl Drop for RefGuard<'_> {
    fn drop(&mut self) {
        self.0.dec_ref();
    }
}
