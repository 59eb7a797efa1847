use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shard::store::StoreFileMetadata;

/// Prefix of every data blob in a shard directory.
pub const DATA_BLOB_PREFIX: &str = "__";

/// Mapping of one physical store file to its data blob in the repository.
///
/// Two infos with equal physical name, length, and checksum describe the
/// same underlying content and are shared across commit points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Logical blob name, always `__<uuid>`.
    name: String,
    physical_name: String,
    length: u64,
    checksum: String,
    /// Maximum bytes per part; `u64::MAX` means a single part.
    part_size: u64,
}

impl FileInfo {
    /// Describe a new data blob for `metadata`, split into parts of at
    /// most `part_size` bytes.
    pub fn new(name: impl Into<String>, metadata: &StoreFileMetadata, part_size: u64) -> Self {
        Self {
            name: name.into(),
            physical_name: metadata.name.clone(),
            length: metadata.length,
            checksum: metadata.checksum.clone(),
            part_size: part_size.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn number_of_parts(&self) -> u32 {
        if self.length == 0 {
            1
        } else {
            self.length.div_ceil(self.part_size) as u32
        }
    }

    /// Length of part `i`; every part but the last is `part_size` bytes.
    pub fn part_bytes(&self, part: u32) -> u64 {
        debug_assert!(part < self.number_of_parts());
        if self.number_of_parts() == 1 {
            return self.length;
        }
        let offset = self.part_size * u64::from(part);
        (self.length - offset).min(self.part_size)
    }

    /// Blob name of part `i`: the plain name for single-part blobs,
    /// `<name>.part<i>` otherwise.
    pub fn part_name(&self, part: u32) -> String {
        if self.number_of_parts() == 1 {
            self.name.clone()
        } else {
            format!("{}.part{}", self.name, part)
        }
    }

    /// Whether `metadata` describes the same content as this info.
    pub fn is_same(&self, metadata: &StoreFileMetadata) -> bool {
        self.physical_name == metadata.name
            && self.length == metadata.length
            && self.checksum == metadata.checksum
    }

    pub fn metadata(&self) -> StoreFileMetadata {
        StoreFileMetadata {
            name: self.physical_name.clone(),
            length: self.length,
            checksum: self.checksum.clone(),
        }
    }
}

/// Strip a `.part<i>` suffix off a data blob name, yielding the logical
/// blob name all parts share.
pub fn canonical_blob_name(blob_name: &str) -> &str {
    if let Some(pos) = blob_name.rfind(".part") {
        let suffix = &blob_name[pos + ".part".len()..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return &blob_name[..pos];
        }
    }
    blob_name
}

/// The files of one snapshot of one shard; the unit the catalog is
/// assembled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFiles {
    snapshot: String,
    files: Vec<FileInfo>,
}

impl SnapshotFiles {
    pub fn new(snapshot: impl Into<String>, files: Vec<FileInfo>) -> Self {
        Self {
            snapshot: snapshot.into(),
            files,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }
}

/// Immutable commit point for one (shard, snapshot), stored as
/// `snap-<snapshotUUID>.dat` in the shard directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    snapshot: String,
    files: Vec<FileInfo>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    incremental_file_count: u64,
    incremental_size: u64,
}

impl ShardSnapshot {
    pub fn new(
        snapshot: impl Into<String>,
        files: Vec<FileInfo>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        incremental_file_count: u64,
        incremental_size: u64,
    ) -> Self {
        Self {
            snapshot: snapshot.into(),
            files,
            start_time,
            end_time,
            incremental_file_count,
            incremental_size,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn incremental_file_count(&self) -> u64 {
        self.incremental_file_count
    }

    pub fn incremental_size(&self) -> u64 {
        self.incremental_size
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(FileInfo::length).sum()
    }

    pub fn into_snapshot_files(self) -> SnapshotFiles {
        SnapshotFiles {
            snapshot: self.snapshot,
            files: self.files,
        }
    }
}

/// The shard-level catalog: every commit point sharing this shard
/// directory, stored as the generational `index-<gen>` blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardSnapshots {
    snapshots: Vec<SnapshotFiles>,
}

impl ShardSnapshots {
    pub fn new(snapshots: Vec<SnapshotFiles>) -> Self {
        Self { snapshots }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[SnapshotFiles] {
        &self.snapshots
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots.iter().any(|files| files.snapshot == name)
    }

    /// All infos sharing a physical file name, across every commit point.
    /// `is_same` picks the reusable one by length and checksum.
    pub fn find_physical(&self, physical_name: &str) -> Vec<&FileInfo> {
        let mut out: Vec<&FileInfo> = Vec::new();
        for files in &self.snapshots {
            for info in &files.files {
                if info.physical_name == physical_name
                    && !out.iter().any(|seen| seen.name == info.name)
                {
                    out.push(info);
                }
            }
        }
        out
    }

    /// Look up a data blob by its canonicalized logical name. `None`
    /// means no commit point references the blob.
    pub fn find_name_file(&self, name: &str) -> Option<&FileInfo> {
        self.snapshots
            .iter()
            .flat_map(|files| files.files.iter())
            .find(|info| info.name == name)
    }

    /// A new catalog with `point` prepended.
    pub fn with_commit_point(&self, point: SnapshotFiles) -> Self {
        let mut snapshots = Vec::with_capacity(self.snapshots.len() + 1);
        snapshots.push(point);
        snapshots.extend(self.snapshots.iter().cloned());
        Self { snapshots }
    }

    /// A new catalog without the named snapshot's commit point.
    pub fn without_snapshot(&self, name: &str) -> Self {
        Self {
            snapshots: self
                .snapshots
                .iter()
                .filter(|files| files.snapshot != name)
                .cloned()
                .collect(),
        }
    }
}
