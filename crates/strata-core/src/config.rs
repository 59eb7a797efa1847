use serde::{Deserialize, Serialize};

use strata_types::{RepositoryError, Result};

/// Default throttle rate for both directions: 40 MiB/s.
pub const DEFAULT_BYTES_PER_SEC: i64 = 40 * 1024 * 1024;

fn default_compress() -> bool {
    true
}

fn default_rate() -> i64 {
    DEFAULT_BYTES_PER_SEC
}

/// Settings for one repository instance.
///
/// Immutable for the lifetime of the instance; changing any of these
/// means registering the repository anew.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Compress metadata blobs. Reads are unaffected: whether a blob is
    /// compressed is detected from the blob itself.
    pub compress: bool,
    /// Upload throttle in bytes per second. Non-positive disables it.
    pub max_snapshot_bytes_per_sec: i64,
    /// Download throttle in bytes per second. Non-positive disables it.
    pub max_restore_bytes_per_sec: i64,
    /// Reject every mutating operation.
    pub readonly: bool,
    /// Maximum bytes per data-blob part. `None` disables chunking.
    pub chunk_size: Option<i64>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            compress: default_compress(),
            max_snapshot_bytes_per_sec: default_rate(),
            max_restore_bytes_per_sec: default_rate(),
            readonly: false,
            chunk_size: None,
        }
    }
}

impl RepositorySettings {
    /// Validate settings at repository start.
    pub fn validate(&self) -> Result<()> {
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size <= 0 {
                return Err(RepositoryError::Config(format!(
                    "the chunk size cannot be zero or negative: [{chunk_size}]"
                )));
            }
        }
        Ok(())
    }

    /// Effective chunk size: configured value or "no chunking" (one part
    /// regardless of file length).
    pub fn effective_chunk_size(&self) -> u64 {
        match self.chunk_size {
            Some(chunk_size) if chunk_size > 0 => chunk_size as u64,
            _ => u64::MAX,
        }
    }
}
