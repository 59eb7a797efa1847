use std::sync::Arc;

use tracing::{debug, warn};

use strata_storage::{is_temp_blob_name, BlobContainer};
use strata_types::{IndexId, RepositoryError, Result, SnapshotId};

use crate::exec::{Completion, GroupedCompletion};
use crate::metadata::SnapshotInfo;
use crate::shard::file_info::DATA_BLOB_PREFIX;
use crate::shard::{canonical_blob_name, ShardSnapshots};

use super::{BlobStoreRepository, INDEX_FILE_PREFIX};

impl BlobStoreRepository {
    /// Delete one snapshot.
    ///
    /// Ordering is the crash-safety argument: the catalog commit in step
    /// one is the linearization point, so any crash afterwards leaves
    /// leaked blobs but never broken references.
    pub fn delete_snapshot(
        self: &Arc<Self>,
        snapshot_id: SnapshotId,
        expected_gen: i64,
        completion: Completion<()>,
    ) {
        if self.is_readonly() {
            completion(Err(RepositoryError::ReadOnly {
                repository: self.name().to_string(),
                operation: "delete snapshot".to_string(),
            }));
            return;
        }
        let repo = Arc::clone(self);
        self.pool().spawn_snapshot(move || {
            repo.delete_snapshot_inner(snapshot_id, expected_gen, completion);
        });
    }

    fn delete_snapshot_inner(
        self: &Arc<Self>,
        snapshot_id: SnapshotId,
        expected_gen: i64,
        completion: Completion<()>,
    ) {
        // Provenance is best-effort: an unreadable info blob only costs
        // the shard-level cleanup of this snapshot.
        let snapshot_info: Option<SnapshotInfo> = match self.snapshot_info(&snapshot_id) {
            Ok(info) => Some(info),
            Err(e @ RepositoryError::SnapshotMissing { .. }) => {
                completion(Err(e));
                return;
            }
            Err(e) => {
                warn!(snapshot = %snapshot_id, error = %e, "cannot read snapshot info blob");
                None
            }
        };

        // Drop the snapshot from the catalog first; it is the maintainer
        // of truth for active snapshots.
        let commit = (|| -> Result<(crate::repository_data::RepositoryData, Vec<IndexId>)> {
            let repository_data = self.get_repository_data()?;
            let updated = repository_data
                .without_snapshot(&snapshot_id)
                .map_err(|_| RepositoryError::SnapshotMissing {
                    repository: self.name().to_string(),
                    snapshot: snapshot_id.clone(),
                })?;
            let mut unreferenced: Vec<IndexId> = repository_data
                .indices()
                .filter(|index| updated.resolve_index_id(index.name()).is_none())
                .collect();
            unreferenced.sort();
            self.write_index_gen(&updated, expected_gen)?;
            Ok((repository_data, unreferenced))
        })();
        let (repository_data, unreferenced_indices) = match commit {
            Ok(state) => state,
            Err(e) => {
                completion(Err(e));
                return;
            }
        };

        self.prune_incompatible_snapshot(&snapshot_id);

        // From here on everything is best-effort cleanup.
        if let Ok(root) = self.root_container() {
            let blobs = [
                self.snapshot_blob_name(snapshot_id.uuid()),
                self.global_metadata_blob_name(snapshot_id.uuid()),
            ];
            if let Err(e) = root.delete_blobs_ignoring_if_not_exists(blobs.iter()) {
                warn!(snapshot = %snapshot_id, error = %e, "unable to delete global metadata blobs");
            }
        }

        let indices: Vec<IndexId> = snapshot_info
            .map(|info| {
                info.indices
                    .iter()
                    .filter_map(|name| repository_data.resolve_index_id(name))
                    .collect()
            })
            .unwrap_or_default();

        self.delete_indices(indices, snapshot_id, unreferenced_indices, completion);
    }

    /// Fan per-index cleanup out on the snapshot pool; the fan-in removes
    /// the index directories no snapshot references anymore.
    fn delete_indices(
        self: &Arc<Self>,
        indices: Vec<IndexId>,
        snapshot_id: SnapshotId,
        unreferenced_indices: Vec<IndexId>,
        completion: Completion<()>,
    ) {
        let finish: Completion<Vec<()>> = {
            let repo = Arc::clone(self);
            Box::new(move |result| match result {
                Ok(_) => {
                    repo.delete_unreferenced_index_directories(&unreferenced_indices);
                    completion(Ok(()));
                }
                Err(e) => completion(Err(e)),
            })
        };

        if indices.is_empty() {
            finish(Ok(Vec::new()));
            return;
        }

        let grouped = GroupedCompletion::new(indices.len(), finish);
        for index_id in indices {
            let repo = Arc::clone(self);
            let snapshot_id = snapshot_id.clone();
            let grouped = grouped.clone();
            self.pool().spawn_snapshot(move || {
                repo.delete_index_snapshot(&index_id, &snapshot_id);
                grouped.on_response(());
            });
        }
    }

    /// Remove one snapshot's traces from one index: its metadata blob and
    /// every shard's commit point, catalog entry, and orphaned data blobs.
    fn delete_index_snapshot(&self, index_id: &IndexId, snapshot_id: &SnapshotId) {
        let index_metadata = match self.index_metadata(snapshot_id, index_id) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(snapshot = %snapshot_id, index = %index_id, error = %e,
                      "failed to read metadata for index");
                None
            }
        };

        match self.index_container(index_id) {
            Ok(container) => {
                if let Err(e) = self.index_metadata_format().delete(&container, snapshot_id.uuid())
                {
                    warn!(snapshot = %snapshot_id, index = %index_id, error = %e,
                          "failed to delete metadata for index");
                }
            }
            Err(e) => {
                warn!(index = %index_id, error = %e, "cannot open index container");
                return;
            }
        }

        if let Some(metadata) = index_metadata {
            for shard in 0..metadata.shard_count {
                if let Err(e) = self.delete_shard_snapshot(index_id, shard, snapshot_id) {
                    warn!(snapshot = %snapshot_id, index = %index_id, shard,
                          error = %e, "failed to delete shard data");
                }
            }
        }
    }

    /// Rewrite one shard's catalog without the snapshot and unlink every
    /// data blob no commit point references anymore.
    fn delete_shard_snapshot(
        &self,
        index_id: &IndexId,
        shard: u32,
        snapshot_id: &SnapshotId,
    ) -> Result<()> {
        let container = self.shard_container(index_id, shard)?;
        let blobs = container.list_blobs().map_err(|e| {
            self.error(&format!("failed to list content of shard directory: {e}"))
        })?;
        let blob_names: Vec<String> = blobs.keys().cloned().collect();
        let (snapshots, generation) = self.build_shard_snapshots(&container, &blob_names);

        if let Err(e) = self.shard_snapshot_format().delete(&container, snapshot_id.uuid()) {
            warn!(snapshot = %snapshot_id, shard, error = %e,
                  "failed to delete shard commit point blob");
        }

        let remaining = snapshots.without_snapshot(snapshot_id.name());
        self.finalize_shard_deletion(&container, remaining, generation, blob_names, snapshot_id)
    }

    /// Write the new shard catalog generation, then sweep stale catalog
    /// blobs, unreferenced data blobs, and staging leftovers.
    fn finalize_shard_deletion(
        &self,
        container: &BlobContainer,
        remaining: ShardSnapshots,
        generation: i64,
        blob_names: Vec<String>,
        snapshot_id: &SnapshotId,
    ) -> Result<()> {
        let blobs_to_delete: Vec<String> = if remaining.is_empty() {
            // The last snapshot of this shard is gone; everything goes.
            blob_names
        } else {
            let new_generation = generation + 1;
            self.shard_snapshots_format()
                .write_atomic(&remaining, container, &new_generation.to_string(), true)
                .map_err(|e| {
                    self.error(&format!(
                        "failed to finalize snapshot deletion [{snapshot_id}] with shard index [index-{new_generation}]: {e}"
                    ))
                })?;
            blob_names
                .into_iter()
                .filter(|name| {
                    name.starts_with(INDEX_FILE_PREFIX)
                        || is_temp_blob_name(name)
                        || (name.starts_with(DATA_BLOB_PREFIX)
                            && remaining.find_name_file(canonical_blob_name(name)).is_none())
                })
                .collect()
        };

        debug!(container = %container.path(), count = blobs_to_delete.len(),
               "sweeping shard blobs after deletion");
        if let Err(e) = container.delete_blobs_ignoring_if_not_exists(&blobs_to_delete) {
            warn!(snapshot = %snapshot_id, error = %e, "failed to delete blobs during finalization");
        }
        Ok(())
    }

    fn delete_unreferenced_index_directories(&self, indices: &[IndexId]) {
        for index_id in indices {
            match self.index_container(index_id) {
                Ok(container) => {
                    if let Err(e) = container.delete() {
                        warn!(repository = %self.name(), index = %index_id, error = %e,
                              "index is no longer part of any snapshot but its directory could not be removed");
                    }
                }
                Err(e) => {
                    warn!(index = %index_id, error = %e, "cannot open index container for cleanup")
                }
            }
        }
    }
}
