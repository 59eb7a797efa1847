use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use strata_types::{IndexId, RepositoryError, Result, SnapshotId};

use crate::metadata::SnapshotState;

/// Generation value of a repository that has never written a catalog.
pub const EMPTY_GEN: i64 = -1;

/// One snapshot recorded in the repository catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: SnapshotId,
    pub state: SnapshotState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    /// UUIDs of the snapshots referencing this index.
    snapshots: BTreeSet<String>,
}

/// The authoritative repository-level catalog, serialized as the
/// generational `index-<N>` blob.
///
/// Values are copy-on-write: mutating operations return an updated copy,
/// and [`generation`](Self::generation) carries the generation the copy
/// was read at (the CAS token for the next write).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryData {
    snapshots: Vec<SnapshotEntry>,
    /// Index name -> entry. Any index referenced by a live snapshot
    /// appears exactly once.
    indices: BTreeMap<String, IndexEntry>,
    #[serde(skip, default = "empty_gen")]
    generation: i64,
}

fn empty_gen() -> i64 {
    EMPTY_GEN
}

impl Default for RepositoryData {
    fn default() -> Self {
        Self::empty()
    }
}

impl RepositoryData {
    /// The catalog of a blank repository.
    pub fn empty() -> Self {
        Self {
            snapshots: Vec::new(),
            indices: BTreeMap::new(),
            generation: EMPTY_GEN,
        }
    }

    /// Parse a catalog blob read at generation `generation`.
    pub fn from_bytes(blob: &str, bytes: &[u8], generation: i64) -> Result<Self> {
        let mut data: RepositoryData =
            serde_json::from_slice(bytes).map_err(|e| RepositoryError::CorruptedRepository {
                blob: blob.to_string(),
                reason: format!("invalid catalog payload: {e}"),
            })?;
        data.generation = generation;
        Ok(data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// The generation this catalog was read at; `EMPTY_GEN` for a blank
    /// repository.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.snapshots.iter()
    }

    pub fn snapshot_ids(&self) -> impl Iterator<Item = &SnapshotId> {
        self.snapshots.iter().map(|entry| &entry.id)
    }

    pub fn has_snapshot_name(&self, name: &str) -> bool {
        self.snapshots.iter().any(|entry| entry.id.name() == name)
    }

    pub fn find_snapshot(&self, name: &str) -> Option<&SnapshotEntry> {
        self.snapshots.iter().find(|entry| entry.id.name() == name)
    }

    /// Every index referenced by any live snapshot.
    pub fn indices(&self) -> impl Iterator<Item = IndexId> + '_ {
        self.indices
            .iter()
            .map(|(name, entry)| IndexId::new(name.clone(), entry.id.clone()))
    }

    /// Resolve an index name to the repository-assigned id.
    pub fn resolve_index_id(&self, name: &str) -> Option<IndexId> {
        self.indices
            .get(name)
            .map(|entry| IndexId::new(name, entry.id.clone()))
    }

    /// UUIDs of the snapshots referencing the named index.
    pub fn snapshots_for_index(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.indices.get(name).map(|entry| &entry.snapshots)
    }

    /// Record a snapshot and its index references.
    ///
    /// An index already in the catalog keeps its assigned id; a new index
    /// is registered under the id carried by `indices`.
    pub fn with_snapshot(
        &self,
        snapshot_id: &SnapshotId,
        state: SnapshotState,
        indices: &[IndexId],
    ) -> Self {
        let mut updated = self.clone();
        match updated
            .snapshots
            .iter_mut()
            .find(|entry| entry.id == *snapshot_id)
        {
            Some(entry) => entry.state = state,
            None => updated.snapshots.push(SnapshotEntry {
                id: snapshot_id.clone(),
                state,
            }),
        }
        for index in indices {
            let entry = updated
                .indices
                .entry(index.name().to_string())
                .or_insert_with(|| IndexEntry {
                    id: index.id().to_string(),
                    snapshots: BTreeSet::new(),
                });
            entry.snapshots.insert(snapshot_id.uuid().to_string());
        }
        updated
    }

    /// Drop a snapshot and its index references; indices left with no
    /// referencing snapshot are removed entirely.
    pub fn without_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Self> {
        if !self.snapshots.iter().any(|entry| entry.id == *snapshot_id) {
            return Err(RepositoryError::BlobNotFound(snapshot_id.to_string()));
        }
        let mut updated = self.clone();
        updated.snapshots.retain(|entry| entry.id != *snapshot_id);
        for entry in updated.indices.values_mut() {
            entry.snapshots.remove(snapshot_id.uuid());
        }
        updated
            .indices
            .retain(|_, entry| !entry.snapshots.is_empty());
        Ok(updated)
    }

    /// Indices that `snapshot_id` is the only remaining reference to.
    pub fn indices_only_in(&self, snapshot_id: &SnapshotId) -> Vec<IndexId> {
        self.indices
            .iter()
            .filter(|(_, entry)| {
                entry.snapshots.len() == 1 && entry.snapshots.contains(snapshot_id.uuid())
            })
            .map(|(name, entry)| IndexId::new(name.clone(), entry.id.clone()))
            .collect()
    }

    /// Indices referenced by `snapshot_id` at all.
    pub fn indices_in(&self, snapshot_id: &SnapshotId) -> Vec<IndexId> {
        self.indices
            .iter()
            .filter(|(_, entry)| entry.snapshots.contains(snapshot_id.uuid()))
            .map(|(name, entry)| IndexId::new(name.clone(), entry.id.clone()))
            .collect()
    }
}
