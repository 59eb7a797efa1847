pub mod fs_backend;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use strata_types::{RepositoryError, Result};

/// Prefix used for in-flight atomic-write staging blobs.
///
/// A crash between staging and rename leaves one of these behind; shard
/// cleanup treats them as garbage.
pub const TEMP_BLOB_PREFIX: &str = "pending-";

/// Whether a blob name belongs to an unfinished atomic write.
pub fn is_temp_blob_name(name: &str) -> bool {
    name.starts_with(TEMP_BLOB_PREFIX)
}

/// Abstract object store for repository blobs.
///
/// Keys are `/`-separated string paths relative to the store root
/// (e.g. `indices/ab01/0/snap-deadbeef.dat`). Implementations must be
/// safe for concurrent use; every operation blocks the calling thread.
pub trait BlobStore: Send + Sync {
    /// Open a blob for sequential reading.
    ///
    /// Fails with [`RepositoryError::BlobNotFound`] if the key is absent.
    fn read_blob(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Write a blob by draining `data`.
    ///
    /// The stream must yield exactly `length` bytes; a shorter or longer
    /// stream is a hard failure and the blob contents are unspecified.
    /// With `fail_if_exists`, an existing key fails with
    /// [`RepositoryError::BlobAlreadyExists`].
    fn write_blob(
        &self,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<()>;

    /// Write a blob so that it is either durably present with the full
    /// contents or absent — no partial blob is ever visible to readers.
    fn write_blob_atomic(&self, key: &str, data: &[u8], fail_if_exists: bool) -> Result<()>;

    /// Check if a blob exists.
    fn blob_exists(&self, key: &str) -> Result<bool>;

    /// List blobs whose key starts with `prefix`, mapping key to length.
    ///
    /// May fail with [`RepositoryError::ListUnsupported`] on stores that
    /// cannot enumerate (e.g. read-only URL stores); callers must have a
    /// fallback.
    fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>>;

    /// Delete a blob. Fails with [`RepositoryError::BlobNotFound`] if the
    /// key is absent; use the container helpers to ignore missing blobs.
    fn delete_blob(&self, key: &str) -> Result<()>;

    /// Recursively delete every blob under `path`.
    fn delete_path(&self, path: &str) -> Result<()>;

    /// Release any resources held by the store. Called exactly once.
    fn close(&self) {}
}

/// A `/`-separated path identifying one container within a blob store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPath {
    segments: Vec<String>,
}

impl BlobPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Return a new path with one more segment appended.
    pub fn add(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The store key prefix for this path: empty for the root, otherwise
    /// `a/b/c/` with a trailing separator.
    pub fn key_prefix(&self) -> String {
        if self.segments.is_empty() {
            String::new()
        } else {
            let mut prefix = self.segments.join("/");
            prefix.push('/');
            prefix
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.segments.join("/"))
    }
}

/// A view of one directory-like namespace inside a [`BlobStore`].
///
/// All repository code goes through containers; blob names passed to a
/// container are relative and must not contain separators.
#[derive(Clone)]
pub struct BlobContainer {
    store: Arc<dyn BlobStore>,
    path: BlobPath,
}

impl BlobContainer {
    pub fn new(store: Arc<dyn BlobStore>, path: BlobPath) -> Self {
        Self { store, path }
    }

    pub fn path(&self) -> &BlobPath {
        &self.path
    }

    fn key(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(RepositoryError::Config(format!(
                "invalid blob name [{name}]"
            )));
        }
        Ok(format!("{}{}", self.path.key_prefix(), name))
    }

    pub fn read_blob(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        self.store.read_blob(&self.key(name)?)
    }

    /// Read a blob fully into memory.
    pub fn read_blob_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut reader = self.read_blob(name)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn write_blob(
        &self,
        name: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<()> {
        self.store
            .write_blob(&self.key(name)?, data, length, fail_if_exists)
    }

    pub fn write_blob_atomic(&self, name: &str, data: &[u8], fail_if_exists: bool) -> Result<()> {
        self.store
            .write_blob_atomic(&self.key(name)?, data, fail_if_exists)
    }

    pub fn blob_exists(&self, name: &str) -> Result<bool> {
        self.store.blob_exists(&self.key(name)?)
    }

    /// List direct children of this container whose name starts with
    /// `prefix`, mapping the relative blob name to its length.
    pub fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        let container_prefix = self.path.key_prefix();
        let full_prefix = format!("{container_prefix}{prefix}");
        let listed = self.store.list_blobs_by_prefix(&full_prefix)?;
        let mut out = BTreeMap::new();
        for (key, length) in listed {
            let rel = &key[container_prefix.len()..];
            // Nested containers have their own listings.
            if !rel.contains('/') {
                out.insert(rel.to_string(), length);
            }
        }
        Ok(out)
    }

    /// List every direct child of this container.
    pub fn list_blobs(&self) -> Result<BTreeMap<String, u64>> {
        self.list_blobs_by_prefix("")
    }

    pub fn delete_blob_ignoring_if_not_exists(&self, name: &str) -> Result<()> {
        match self.store.delete_blob(&self.key(name)?) {
            Err(RepositoryError::BlobNotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub fn delete_blobs_ignoring_if_not_exists<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.delete_blob_ignoring_if_not_exists(name.as_ref())?;
        }
        Ok(())
    }

    /// Delete this container and everything beneath it.
    pub fn delete(&self) -> Result<()> {
        self.store.delete_path(self.path.key_prefix().trim_end_matches('/'))
    }
}

impl fmt::Debug for BlobContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobContainer")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
