use std::fmt;

use serde::{Deserialize, Serialize};

/// An index identifier: the index name plus a stable repository-assigned id.
///
/// The id survives index renames; blobs are keyed by id, never by name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId {
    name: String,
    id: String,
}

impl IndexId {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Assign a fresh repository id to a named index.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, crate::random_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({}/{})", self.name, self.id)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.id)
    }
}

/// One shard of one index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    index: String,
    shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId([{}][{}])", self.index, self.shard)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}
