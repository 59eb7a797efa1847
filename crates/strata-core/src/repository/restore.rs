use tracing::debug;

use strata_types::{IndexId, RepositoryError, Result, SnapshotId};

use crate::shard::{RecoveryState, ShardStore};

use super::BlobStoreRepository;

impl BlobStoreRepository {
    /// Restore one shard from its commit point, streaming every
    /// referenced data blob back into the local store and driving the
    /// recovery observer.
    pub fn restore_shard(
        &self,
        store: &dyn ShardStore,
        snapshot_id: &SnapshotId,
        index_id: &IndexId,
        shard: u32,
        recovery: &RecoveryState,
    ) -> Result<()> {
        let shard_id = store.shard_id();
        debug!(shard = %shard_id, snapshot = %snapshot_id, repository = %self.name(), "restoring shard");

        let restore_failed = |reason: String| RepositoryError::ShardRestoreFailed {
            shard: shard_id.clone(),
            reason,
        };

        let container = self.shard_container(index_id, shard)?;
        let shard_snapshot = self
            .shard_snapshot_format()
            .read(&container, snapshot_id.uuid())
            .map_err(|e| restore_failed(format!("failed to read shard snapshot file: {e}")))?;
        let snapshot_files = shard_snapshot.into_snapshot_files();

        for file in snapshot_files.files() {
            recovery.add_file(file.physical_name(), file.length());
        }

        for file in snapshot_files.files() {
            let mut reader = self.read_reader_for_restore(container.clone(), file);
            let written = store
                .restore_file(&file.metadata(), &mut reader)
                .map_err(|e| {
                    restore_failed(format!(
                        "failed to restore file [{}]: {e}",
                        file.physical_name()
                    ))
                })?;
            recovery.add_recovered_bytes(file.physical_name(), written);
        }
        Ok(())
    }
}
