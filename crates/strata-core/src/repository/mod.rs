mod create;
mod delete;
mod restore;

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use strata_storage::{BlobContainer, BlobPath, BlobStore};
use strata_types::{random_uuid, IndexId, RepositoryError, Result, SnapshotId};

use crate::codec::ChecksumBlobFormat;
use crate::config::RepositorySettings;
use crate::exec::{assert_snapshot_or_generic_thread, Completion, GroupedCompletion, Step, ThreadPool};
use crate::metadata::{ClusterMetadata, IndexMetadata, ShardFailure, SnapshotInfo};
use crate::repository_data::{RepositoryData, EMPTY_GEN};
use crate::shard::{ShardSnapshot, ShardSnapshots};
use crate::throttle::RateLimiter;

pub const SNAPSHOT_PREFIX: &str = "snap-";
pub const INDEX_FILE_PREFIX: &str = "index-";
pub const INDEX_LATEST_BLOB: &str = "index.latest";
pub const INCOMPATIBLE_SNAPSHOTS_BLOB: &str = "incompatible-snapshots";
pub const TESTS_BLOB_PREFIX: &str = "tests-";

const SNAPSHOT_CODEC: &str = "snapshot";
const SNAPSHOT_INDEX_CODEC: &str = "snapshots";
const METADATA_CODEC: &str = "metadata";
const INDEX_METADATA_CODEC: &str = "index-metadata";

const SNAPSHOT_NAME_FORMAT: &str = "snap-{}.dat";
const METADATA_NAME_FORMAT: &str = "meta-{}.dat";
const SNAPSHOT_INDEX_NAME_FORMAT: &str = "index-{}";

/// Blob-name prefix for one verification round.
pub fn test_blob_prefix(seed: &str) -> String {
    format!("{TESTS_BLOB_PREFIX}{seed}")
}

enum StoreSlot {
    Unset,
    Ready(Arc<dyn BlobStore>),
    Closed,
}

/// Factory producing the store handle on first use; the repository owns
/// exactly one handle and closes it exactly once.
pub type BlobStoreFactory = Box<dyn Fn() -> Result<Arc<dyn BlobStore>> + Send + Sync>;

/// A snapshot repository over an opaque blob store.
///
/// One instance executes snapshot lifecycle operations for one repository
/// on one node; cross-node scheduling belongs to an external coordinator.
/// Readers are concurrent and lock-free; all writes into the repository's
/// blob namespace are owned by this engine and serialized through the
/// generational catalog CAS.
pub struct BlobStoreRepository {
    name: String,
    settings: RepositorySettings,
    base_path: BlobPath,
    pool: Arc<ThreadPool>,
    factory: BlobStoreFactory,
    store: Mutex<StoreSlot>,
    started: AtomicBool,
    snapshot_throttle: Option<Arc<RateLimiter>>,
    restore_throttle: Option<Arc<RateLimiter>>,
    snapshot_throttle_nanos: Arc<AtomicU64>,
    restore_throttle_nanos: Arc<AtomicU64>,
    global_metadata_format: ChecksumBlobFormat<ClusterMetadata>,
    index_metadata_format: ChecksumBlobFormat<IndexMetadata>,
    snapshot_format: ChecksumBlobFormat<SnapshotInfo>,
    shard_snapshot_format: ChecksumBlobFormat<ShardSnapshot>,
    shard_snapshots_format: ChecksumBlobFormat<ShardSnapshots>,
}

impl BlobStoreRepository {
    pub fn new(
        name: impl Into<String>,
        settings: RepositorySettings,
        base_path: BlobPath,
        pool: Arc<ThreadPool>,
        factory: BlobStoreFactory,
    ) -> Self {
        let compress = settings.compress;
        Self {
            name: name.into(),
            snapshot_throttle: RateLimiter::from_bytes_per_sec(settings.max_snapshot_bytes_per_sec),
            restore_throttle: RateLimiter::from_bytes_per_sec(settings.max_restore_bytes_per_sec),
            settings,
            base_path,
            pool,
            factory,
            store: Mutex::new(StoreSlot::Unset),
            started: AtomicBool::new(false),
            snapshot_throttle_nanos: Arc::new(AtomicU64::new(0)),
            restore_throttle_nanos: Arc::new(AtomicU64::new(0)),
            global_metadata_format: ChecksumBlobFormat::new(
                METADATA_CODEC,
                METADATA_NAME_FORMAT,
                compress,
            ),
            index_metadata_format: ChecksumBlobFormat::new(
                INDEX_METADATA_CODEC,
                METADATA_NAME_FORMAT,
                compress,
            ),
            snapshot_format: ChecksumBlobFormat::new(SNAPSHOT_CODEC, SNAPSHOT_NAME_FORMAT, compress),
            shard_snapshot_format: ChecksumBlobFormat::new(
                SNAPSHOT_CODEC,
                SNAPSHOT_NAME_FORMAT,
                compress,
            ),
            shard_snapshots_format: ChecksumBlobFormat::new(
                SNAPSHOT_INDEX_CODEC,
                SNAPSHOT_INDEX_NAME_FORMAT,
                compress,
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn is_readonly(&self) -> bool {
        self.settings.readonly
    }

    pub fn base_path(&self) -> &BlobPath {
        &self.base_path
    }

    pub(crate) fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Nanoseconds upload streams spent blocked on the snapshot throttle.
    pub fn snapshot_throttle_nanos(&self) -> u64 {
        self.snapshot_throttle_nanos.load(Ordering::Relaxed)
    }

    /// Nanoseconds restore streams spent blocked on the restore throttle.
    pub fn restore_throttle_nanos(&self) -> u64 {
        self.restore_throttle_nanos.load(Ordering::Relaxed)
    }

    /// Validate settings and accept operations.
    pub fn start(&self) -> Result<()> {
        self.settings.validate()?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Close the blob store exactly once. Subsequent operations fail.
    pub fn close(&self) {
        let mut slot = self.store.lock().unwrap();
        if let StoreSlot::Ready(store) = std::mem::replace(&mut *slot, StoreSlot::Closed) {
            store.close();
        }
    }

    /// Lazily created, shared blob store handle.
    pub(crate) fn blob_store(&self) -> Result<Arc<dyn BlobStore>> {
        assert_snapshot_or_generic_thread();
        let mut slot = self.store.lock().unwrap();
        match &*slot {
            StoreSlot::Ready(store) => Ok(Arc::clone(store)),
            StoreSlot::Closed => Err(self.error("repository is closed")),
            StoreSlot::Unset => {
                if !self.started.load(Ordering::Acquire) {
                    return Err(self.error("repository is not in started state"));
                }
                let store = (self.factory)().map_err(|e| {
                    self.error(&format!("cannot create blob store: {e}"))
                })?;
                *slot = StoreSlot::Ready(Arc::clone(&store));
                Ok(store)
            }
        }
    }

    pub(crate) fn error(&self, reason: &str) -> RepositoryError {
        RepositoryError::Repository {
            repository: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn container(&self, path: BlobPath) -> Result<BlobContainer> {
        Ok(BlobContainer::new(self.blob_store()?, path))
    }

    pub(crate) fn root_container(&self) -> Result<BlobContainer> {
        self.container(self.base_path.clone())
    }

    fn indices_path(&self) -> BlobPath {
        self.base_path.add("indices")
    }

    pub(crate) fn index_container(&self, index_id: &IndexId) -> Result<BlobContainer> {
        self.container(self.indices_path().add(index_id.id()))
    }

    pub(crate) fn shard_container(&self, index_id: &IndexId, shard: u32) -> Result<BlobContainer> {
        self.container(self.indices_path().add(index_id.id()).add(shard.to_string()))
    }

    // -----------------------------------------------------------------------
    // Repository catalog (generational, CAS-serialized)
    // -----------------------------------------------------------------------

    /// The current repository catalog; [`RepositoryData::empty`] for a
    /// blank repository.
    pub fn get_repository_data(&self) -> Result<RepositoryData> {
        let generation = self.latest_index_blob_id()?;
        if generation == EMPTY_GEN {
            return Ok(RepositoryData::empty());
        }
        self.read_repository_data_at(generation)
    }

    /// Read the catalog at an explicit generation (downgrade reads after
    /// discovering a corrupt `index-<N>`).
    pub fn read_repository_data_at(&self, generation: i64) -> Result<RepositoryData> {
        let blob_name = format!("{INDEX_FILE_PREFIX}{generation}");
        let container = self.root_container()?;
        let bytes = match container.read_blob_bytes(&blob_name) {
            Ok(bytes) => bytes,
            // The pointer outran an interrupted cleanup; a blank repo.
            Err(RepositoryError::BlobNotFound(_)) => return Ok(RepositoryData::empty()),
            Err(e) => {
                return Err(self.error(&format!(
                    "could not read repository data from [{blob_name}]: {e}"
                )))
            }
        };
        RepositoryData::from_bytes(&blob_name, &bytes, generation)
    }

    /// The latest catalog generation. Listing `index-*` is authoritative;
    /// `index.latest` is only a fallback for stores that cannot list.
    pub fn latest_index_blob_id(&self) -> Result<i64> {
        match self.list_blobs_to_get_latest_index_id() {
            Ok(generation) => Ok(generation),
            Err(RepositoryError::ListUnsupported) => match self.read_index_latest_blob() {
                Ok(generation) => Ok(generation),
                Err(RepositoryError::BlobNotFound(_)) => Ok(EMPTY_GEN),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn list_blobs_to_get_latest_index_id(&self) -> Result<i64> {
        let container = self.root_container()?;
        let blobs = container.list_blobs_by_prefix(INDEX_FILE_PREFIX)?;
        let mut latest = EMPTY_GEN;
        for name in blobs.keys() {
            match name[INDEX_FILE_PREFIX.len()..].parse::<i64>() {
                Ok(generation) => latest = latest.max(generation),
                // Not an index-N blob; it doesn't belong in the repository.
                Err(_) => debug!(repository = %self.name, blob = %name, "unknown blob in the repository"),
            }
        }
        Ok(latest)
    }

    fn read_index_latest_blob(&self) -> Result<i64> {
        let container = self.root_container()?;
        let bytes = container.read_blob_bytes(INDEX_LATEST_BLOB)?;
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            RepositoryError::CorruptedRepository {
                blob: INDEX_LATEST_BLOB.to_string(),
                reason: format!("expected 8 bytes, found {}", bytes.len()),
            }
        })?;
        Ok(i64::from_be_bytes(raw))
    }

    /// Commit an updated catalog at `expected_gen + 1`.
    ///
    /// The optimistic CAS happens twice: a re-read of the latest
    /// generation, then the fail-if-exists write of `index-<new_gen>` that
    /// loses cleanly when two writers race past the first check.
    pub fn write_index_gen(&self, data: &RepositoryData, expected_gen: i64) -> Result<i64> {
        if self.is_readonly() {
            return Err(RepositoryError::ReadOnly {
                repository: self.name.clone(),
                operation: "write the repository catalog".to_string(),
            });
        }
        let current_gen = self.latest_index_blob_id()?;
        if current_gen != expected_gen {
            return Err(RepositoryError::ConcurrentModification {
                repository: self.name.clone(),
                expected: expected_gen,
                actual: current_gen,
            });
        }
        let new_gen = expected_gen + 1;
        let container = self.root_container()?;
        let blob_name = format!("{INDEX_FILE_PREFIX}{new_gen}");
        debug!(repository = %self.name, blob = %blob_name, "writing new catalog generation");
        match container.write_blob_atomic(&blob_name, &data.to_bytes()?, true) {
            Ok(()) => {}
            Err(RepositoryError::BlobAlreadyExists(_)) => {
                return Err(RepositoryError::ConcurrentModification {
                    repository: self.name.clone(),
                    expected: expected_gen,
                    actual: new_gen,
                });
            }
            Err(e) => return Err(e),
        }

        debug!(repository = %self.name, generation = new_gen, "updating index.latest");
        container.write_blob_atomic(INDEX_LATEST_BLOB, &new_gen.to_be_bytes(), false)?;

        // Keep one prior generation around as a one-step rollback.
        if new_gen - 2 >= 0 {
            let stale = format!("{INDEX_FILE_PREFIX}{}", new_gen - 2);
            if let Err(e) = container.delete_blob_ignoring_if_not_exists(&stale) {
                warn!(repository = %self.name, blob = %stale, error = %e, "failed to clean up old catalog blob");
            }
        }
        Ok(new_gen)
    }

    // -----------------------------------------------------------------------
    // Incompatible snapshots
    // -----------------------------------------------------------------------

    /// Snapshot ids recorded as too old to restore. Absent blob means none.
    pub fn incompatible_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let container = self.root_container()?;
        let bytes = match container.read_blob_bytes(INCOMPATIBLE_SNAPSHOTS_BLOB) {
            Ok(bytes) => bytes,
            Err(RepositoryError::BlobNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes).map_err(|e| RepositoryError::CorruptedRepository {
            blob: INCOMPATIBLE_SNAPSHOTS_BLOB.to_string(),
            reason: format!("invalid payload: {e}"),
        })
    }

    pub(crate) fn prune_incompatible_snapshot(&self, snapshot_id: &SnapshotId) {
        let result = (|| -> Result<()> {
            let mut ids = self.incompatible_snapshots()?;
            let before = ids.len();
            ids.retain(|id| id != snapshot_id);
            if ids.len() != before {
                let container = self.root_container()?;
                container.write_blob_atomic(
                    INCOMPATIBLE_SNAPSHOTS_BLOB,
                    &serde_json::to_vec(&ids)?,
                    false,
                )?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!(repository = %self.name, snapshot = %snapshot_id, error = %e,
                  "failed to prune incompatible snapshots blob");
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot metadata readers
    // -----------------------------------------------------------------------

    pub fn snapshot_info(&self, snapshot_id: &SnapshotId) -> Result<SnapshotInfo> {
        let container = self.root_container()?;
        self.snapshot_format
            .read(&container, snapshot_id.uuid())
            .map_err(|e| self.missing_or(snapshot_id, e, "failed to read snapshot info"))
    }

    pub fn global_metadata(&self, snapshot_id: &SnapshotId) -> Result<ClusterMetadata> {
        let container = self.root_container()?;
        self.global_metadata_format
            .read(&container, snapshot_id.uuid())
            .map_err(|e| self.missing_or(snapshot_id, e, "failed to read global metadata"))
    }

    pub fn index_metadata(
        &self,
        snapshot_id: &SnapshotId,
        index_id: &IndexId,
    ) -> Result<IndexMetadata> {
        let container = self.index_container(index_id)?;
        self.index_metadata_format
            .read(&container, snapshot_id.uuid())
            .map_err(|e| self.missing_or(snapshot_id, e, "failed to read index metadata"))
    }

    fn missing_or(
        &self,
        snapshot_id: &SnapshotId,
        err: RepositoryError,
        context: &str,
    ) -> RepositoryError {
        match err {
            RepositoryError::BlobNotFound(_) => RepositoryError::SnapshotMissing {
                repository: self.name.clone(),
                snapshot: snapshot_id.clone(),
            },
            other => self.error(&format!("{context} for [{snapshot_id}]: {other}")),
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot initialization and finalization
    // -----------------------------------------------------------------------

    /// Reserve a snapshot id and persist the cluster and per-index
    /// metadata blobs before any shard snapshot starts.
    pub fn initialize_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        indices: &[IndexId],
        cluster_metadata: &ClusterMetadata,
    ) -> Result<()> {
        if self.is_readonly() {
            return Err(RepositoryError::ReadOnly {
                repository: self.name.clone(),
                operation: "create snapshot".to_string(),
            });
        }
        let repository_data = self.get_repository_data()?;
        if repository_data.has_snapshot_name(snapshot_id.name()) {
            return Err(RepositoryError::InvalidSnapshotName {
                repository: self.name.clone(),
                name: snapshot_id.name().to_string(),
                reason: "snapshot with the same name already exists".to_string(),
            });
        }

        let creation_failed = |reason: String| RepositoryError::SnapshotCreation {
            repository: self.name.clone(),
            snapshot: snapshot_id.clone(),
            reason,
        };

        let root = self.root_container()?;
        self.global_metadata_format
            .write(cluster_metadata, &root, snapshot_id.uuid(), true)
            .map_err(|e| creation_failed(format!("failed to write global metadata: {e}")))?;

        for index in indices {
            let index_metadata = cluster_metadata.index(index.name()).ok_or_else(|| {
                creation_failed(format!("no metadata for index [{}]", index.name()))
            })?;
            let container = self.index_container(index)?;
            self.index_metadata_format
                .write(index_metadata, &container, snapshot_id.uuid(), false)
                .map_err(|e| {
                    creation_failed(format!(
                        "failed to write metadata for index [{}]: {e}",
                        index.name()
                    ))
                })?;
        }
        Ok(())
    }

    /// Finalize a snapshot: re-write all metadata blobs concurrently
    /// (idempotent against coordinator failover), then commit the catalog
    /// generation. The generation write is the linearization point; a
    /// raced `index-<N+1>` fails the whole attempt with
    /// [`RepositoryError::ConcurrentModification`].
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_snapshot(
        self: &Arc<Self>,
        snapshot_id: SnapshotId,
        indices: Vec<IndexId>,
        start_time: DateTime<Utc>,
        failure: Option<String>,
        total_shards: u32,
        shard_failures: Vec<ShardFailure>,
        expected_gen: i64,
        include_global_state: bool,
        cluster_metadata: ClusterMetadata,
        completion: Completion<SnapshotInfo>,
    ) {
        if self.is_readonly() {
            completion(Err(RepositoryError::ReadOnly {
                repository: self.name.clone(),
                operation: "finalize snapshot".to_string(),
            }));
            return;
        }

        // Once all metadata is written, commit the catalog generation.
        let after_meta_writes: Step<SnapshotInfo> = Step::new();
        {
            let repo = Arc::clone(self);
            let snapshot_id = snapshot_id.clone();
            let indices = indices.clone();
            after_meta_writes.when_complete(Box::new(move |result| match result {
                Ok(info) => {
                    let committed = repo.get_repository_data().and_then(|data| {
                        let updated = data.with_snapshot(&snapshot_id, info.state, &indices);
                        repo.write_index_gen(&updated, expected_gen)
                    });
                    match committed {
                        Ok(_) => completion(Ok(info)),
                        Err(e) => completion(Err(e)),
                    }
                }
                Err(e) => completion(Err(e)),
            }));
        }

        // One slot per metadata blob: global state, each index, and the
        // snapshot info record. All writes tolerate pre-existing blobs;
        // only the generational catalog write is fail-if-exists.
        let all_meta = GroupedCompletion::<Option<SnapshotInfo>>::new(
            2 + indices.len(),
            Box::new({
                let sink = after_meta_writes.sink();
                move |result| match result {
                    Ok(results) => {
                        let info = results
                            .into_iter()
                            .flatten()
                            .next()
                            .expect("exactly one branch yields the snapshot info");
                        sink(Ok(info));
                    }
                    Err(e) => sink(Err(e)),
                }
            }),
        );

        {
            let repo = Arc::clone(self);
            let grouped = all_meta.clone();
            let snapshot_id = snapshot_id.clone();
            let cluster_metadata = cluster_metadata.clone();
            self.pool.spawn_snapshot(move || {
                let result = repo.root_container().and_then(|root| {
                    repo.global_metadata_format
                        .write(&cluster_metadata, &root, snapshot_id.uuid(), false)
                });
                match result {
                    Ok(()) => grouped.on_response(None),
                    Err(e) => grouped.on_failure(e),
                }
            });
        }

        for index in indices.clone() {
            let repo = Arc::clone(self);
            let grouped = all_meta.clone();
            let snapshot_id = snapshot_id.clone();
            let cluster_metadata = cluster_metadata.clone();
            self.pool.spawn_snapshot(move || {
                let result = (|| -> Result<()> {
                    let index_metadata = cluster_metadata.index(index.name()).ok_or_else(|| {
                        repo.error(&format!("no metadata for index [{}]", index.name()))
                    })?;
                    let container = repo.index_container(&index)?;
                    repo.index_metadata_format.write(
                        index_metadata,
                        &container,
                        snapshot_id.uuid(),
                        false,
                    )
                })();
                match result {
                    Ok(()) => grouped.on_response(None),
                    Err(e) => grouped.on_failure(e),
                }
            });
        }

        {
            let repo = Arc::clone(self);
            let grouped = all_meta;
            self.pool.spawn_snapshot(move || {
                let info = SnapshotInfo::finished(
                    snapshot_id.clone(),
                    indices.iter().map(|i| i.name().to_string()).collect(),
                    start_time,
                    Utc::now(),
                    failure,
                    total_shards,
                    shard_failures,
                    include_global_state,
                );
                let result = repo.root_container().and_then(|root| {
                    repo.snapshot_format
                        .write(&info, &root, snapshot_id.uuid(), false)
                });
                match result {
                    Ok(()) => grouped.on_response(Some(info)),
                    Err(e) => grouped.on_failure(e),
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Verification probe
    // -----------------------------------------------------------------------

    /// Coordinator half of the reachability probe. Read-only repositories
    /// are merely smoke-read; otherwise a seed blob is planted for the
    /// nodes to find.
    pub fn start_verification(&self) -> Result<String> {
        if self.is_readonly() {
            self.latest_index_blob_id().map_err(|e| {
                RepositoryError::Verification {
                    repository: self.name.clone(),
                    reason: format!("path {} is not accessible on the coordinator: {e}", self.base_path),
                }
            })?;
            return Ok("read-only".to_string());
        }
        let seed = random_uuid();
        let container = self.container(self.base_path.add(test_blob_prefix(&seed)))?;
        container
            .write_blob_atomic("master.dat", seed.as_bytes(), true)
            .map_err(|e| RepositoryError::Verification {
                repository: self.name.clone(),
                reason: format!("path {} is not accessible on the coordinator: {e}", self.base_path),
            })?;
        Ok(seed)
    }

    /// Node half of the probe: assert the coordinator's blob is readable
    /// here, then leave a node-specific blob next to it.
    pub fn verify(&self, seed: &str, node_id: &str) -> Result<()> {
        assert_snapshot_or_generic_thread();
        if self.is_readonly() {
            return self.latest_index_blob_id().map(|_| ()).map_err(|e| {
                RepositoryError::Verification {
                    repository: self.name.clone(),
                    reason: format!(
                        "path {} is not accessible on node [{node_id}]: {e}",
                        self.base_path
                    ),
                }
            });
        }
        let container = self.container(self.base_path.add(test_blob_prefix(seed)))?;
        if container.blob_exists("master.dat")? {
            let payload = seed.as_bytes();
            container
                .write_blob(
                    &format!("data-{node_id}.dat"),
                    &mut std::io::Cursor::new(payload),
                    payload.len() as u64,
                    true,
                )
                .map_err(|e| RepositoryError::Verification {
                    repository: self.name.clone(),
                    reason: format!("store location is not accessible on node [{node_id}]: {e}"),
                })
        } else {
            Err(RepositoryError::Verification {
                repository: self.name.clone(),
                reason: format!(
                    "a blob written by the coordinator cannot be accessed on node [{node_id}]; \
                     the store may not be shared between this node and the coordinator"
                ),
            })
        }
    }

    /// Tear down the probe blobs.
    pub fn end_verification(&self, seed: &str) -> Result<()> {
        if self.is_readonly() {
            return Ok(());
        }
        let container = self.container(self.base_path.add(test_blob_prefix(seed)))?;
        container.delete().map_err(|e| RepositoryError::Verification {
            repository: self.name.clone(),
            reason: format!("cannot delete probe data at {}: {e}", self.base_path),
        })
    }

    // -----------------------------------------------------------------------
    // Shard catalog
    // -----------------------------------------------------------------------

    /// Load the shard catalog from a listing of the shard directory.
    ///
    /// The largest readable `index-<gen>` is authoritative and never
    /// cross-checked against commit points. Rebuilding from individual
    /// `snap-*.dat` blobs is a recovery path for single-writer contexts.
    pub(crate) fn build_shard_snapshots(
        &self,
        container: &BlobContainer,
        blob_names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> (ShardSnapshots, i64) {
        let mut latest = -1i64;
        let mut names: Vec<String> = Vec::new();
        for name in blob_names {
            let name = name.as_ref();
            names.push(name.to_string());
            if let Some(suffix) = name.strip_prefix(INDEX_FILE_PREFIX) {
                match suffix.parse::<i64>() {
                    Ok(generation) => latest = latest.max(generation),
                    Err(_) => warn!(blob = %name, "failed to parse shard catalog blob name"),
                }
            }
        }

        if latest >= 0 {
            match self
                .shard_snapshots_format
                .read(container, &latest.to_string())
            {
                Ok(snapshots) => return (snapshots, latest),
                Err(e) => {
                    warn!(container = %container.path(), generation = latest, error = %e,
                          "failed to read shard catalog blob");
                }
            }
        } else if !names.is_empty() {
            warn!(container = %container.path(),
                  "no readable catalog blob in a non-empty shard snapshot directory");
        }

        // Recovery: assemble the catalog from individual commit points.
        let mut snapshots = Vec::new();
        for name in &names {
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".dat") {
                match self.shard_snapshot_format.read_blob(container, name) {
                    Ok(snapshot) => snapshots.push(snapshot.into_snapshot_files()),
                    Err(e) => warn!(blob = %name, error = %e, "failed to read commit point blob"),
                }
            }
        }
        (ShardSnapshots::new(snapshots), latest)
    }

    pub(crate) fn read_reader_for_restore(
        &self,
        container: BlobContainer,
        file: &crate::shard::FileInfo,
    ) -> impl Read + Send {
        let parts: Vec<String> = (0..file.number_of_parts())
            .map(|i| file.part_name(i))
            .collect();
        let sliced = crate::stream::SlicedInput::new(file.number_of_parts(), move |slice| {
            container
                .read_blob(&parts[slice as usize])
                .map_err(|e| std::io::Error::other(e.to_string()))
        });
        crate::throttle::RateLimitedRead::new(
            sliced,
            self.restore_throttle.clone(),
            Arc::clone(&self.restore_throttle_nanos),
        )
    }

    pub(crate) fn snapshot_throttle(&self) -> Option<Arc<RateLimiter>> {
        self.snapshot_throttle.clone()
    }

    pub(crate) fn snapshot_throttle_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.snapshot_throttle_nanos)
    }

    pub(crate) fn shard_snapshot_format(&self) -> &ChecksumBlobFormat<ShardSnapshot> {
        &self.shard_snapshot_format
    }

    pub(crate) fn shard_snapshots_format(&self) -> &ChecksumBlobFormat<ShardSnapshots> {
        &self.shard_snapshots_format
    }

    pub(crate) fn index_metadata_format(&self) -> &ChecksumBlobFormat<IndexMetadata> {
        &self.index_metadata_format
    }

    pub(crate) fn global_metadata_blob_name(&self, uuid: &str) -> String {
        self.global_metadata_format.blob_name(uuid)
    }

    pub(crate) fn snapshot_blob_name(&self, uuid: &str) -> String {
        self.snapshot_format.blob_name(uuid)
    }
}

impl std::fmt::Debug for BlobStoreRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStoreRepository")
            .field("name", &self.name)
            .field("base_path", &self.base_path)
            .field("readonly", &self.settings.readonly)
            .finish_non_exhaustive()
    }
}
