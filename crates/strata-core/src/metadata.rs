use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_types::SnapshotId;

/// Global cluster metadata captured alongside a snapshot.
///
/// The engine treats the contents as opaque provenance; only the index
/// list is interpreted (the deleter needs per-index shard counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub cluster_name: String,
    /// Cluster-state UUID at capture time.
    pub state_uuid: String,
    pub indices: Vec<IndexMetadata>,
}

impl ClusterMetadata {
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.iter().find(|index| index.name == name)
    }
}

/// Metadata for one index at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub shard_count: u32,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Lifecycle state of a snapshot as recorded in the repository catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    InProgress,
    Success,
    Partial,
    Failed,
}

impl SnapshotState {
    /// Whether the snapshot finished, successfully or not.
    pub fn completed(self) -> bool {
        !matches!(self, SnapshotState::InProgress)
    }
}

/// A shard that failed while the snapshot as a whole went through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub index: String,
    pub shard: u32,
    pub reason: String,
}

/// Summary of one finalized snapshot, stored as `snap-<uuid>.dat` at the
/// repository root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: SnapshotId,
    pub indices: Vec<String>,
    pub state: SnapshotState,
    #[serde(default)]
    pub reason: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_shards: u32,
    #[serde(default)]
    pub shard_failures: Vec<ShardFailure>,
    pub include_global_state: bool,
}

impl SnapshotInfo {
    /// Build the record for a finished snapshot, deriving its state from
    /// the failure information.
    #[allow(clippy::too_many_arguments)]
    pub fn finished(
        snapshot: SnapshotId,
        indices: Vec<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        failure: Option<String>,
        total_shards: u32,
        shard_failures: Vec<ShardFailure>,
        include_global_state: bool,
    ) -> Self {
        let state = if failure.is_some() {
            SnapshotState::Failed
        } else if shard_failures.is_empty() {
            SnapshotState::Success
        } else {
            SnapshotState::Partial
        };
        Self {
            snapshot,
            indices,
            state,
            reason: failure,
            start_time,
            end_time,
            total_shards,
            shard_failures,
            include_global_state,
        }
    }
}
