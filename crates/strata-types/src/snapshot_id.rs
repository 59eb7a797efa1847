use std::fmt;

use serde::{Deserialize, Serialize};

/// A snapshot identifier: a human-chosen name plus an opaque UUID.
///
/// The name is unique among live snapshots in a repository; the UUID is
/// immutable and embedded in every blob name belonging to the snapshot,
/// so a deleted-and-recreated snapshot with the same name never collides
/// with blobs of its predecessor.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId {
    name: String,
    uuid: String,
}

impl SnapshotId {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Create an id with a freshly generated UUID.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, crate::random_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({}/{})", self.name, self.uuid)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}
