use thiserror::Error;

use crate::{ShardId, SnapshotId};

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Terminal error conditions surfaced by the snapshot repository engine.
///
/// Each variant is a final state for the operation that produced it; the
/// engine never narrates nested causes beyond the reason string.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("[{repository}] repository error: {reason}")]
    Repository { repository: String, reason: String },

    #[error("[{repository}] verification failed: {reason}")]
    Verification { repository: String, reason: String },

    #[error(
        "[{repository}] concurrent modification of the repository catalog, \
         expected generation [{expected}], actual [{actual}]"
    )]
    ConcurrentModification {
        repository: String,
        expected: i64,
        actual: i64,
    },

    #[error("[{repository}] snapshot [{snapshot}] is missing")]
    SnapshotMissing {
        repository: String,
        snapshot: SnapshotId,
    },

    #[error("[{repository}] invalid snapshot name [{name}]: {reason}")]
    InvalidSnapshotName {
        repository: String,
        name: String,
        reason: String,
    },

    #[error("[{repository}] failed to create snapshot [{snapshot}]: {reason}")]
    SnapshotCreation {
        repository: String,
        snapshot: SnapshotId,
        reason: String,
    },

    #[error("{shard} shard snapshot failed: {reason}")]
    ShardSnapshotFailed { shard: ShardId, reason: String },

    #[error("{shard} shard restore failed: {reason}")]
    ShardRestoreFailed { shard: ShardId, reason: String },

    #[error("snapshot aborted")]
    SnapshotAborted,

    #[error("corrupted repository blob [{blob}]: {reason}")]
    CorruptedRepository { blob: String, reason: String },

    #[error("[{repository}] cannot {operation} in a readonly repository")]
    ReadOnly {
        repository: String,
        operation: String,
    },

    #[error("blob [{0}] not found")]
    BlobNotFound(String),

    #[error("blob [{0}] already exists")]
    BlobAlreadyExists(String),

    #[error("listing blobs by prefix is not supported by this store")]
    ListUnsupported,

    #[error("checksum mismatch for [{name}]: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Whether a retry against the same store could plausibly succeed.
    ///
    /// Only shard-transport style I/O failures qualify; logical failures
    /// (CAS conflicts, corruption, missing snapshots) never do.
    pub fn is_transient(&self) -> bool {
        match self {
            RepositoryError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether this error indicates corrupted data read from the local
    /// shard store, as opposed to a repository-side failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RepositoryError::ChecksumMismatch { .. } | RepositoryError::CorruptedRepository { .. }
        )
    }
}
