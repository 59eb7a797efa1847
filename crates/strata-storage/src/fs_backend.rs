use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use rand::RngCore;

use strata_types::{RepositoryError, Result};

use crate::{BlobStore, TEMP_BLOB_PREFIX};

const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Blob store over a local filesystem directory.
///
/// Atomic writes are staged to a `pending-` sibling and renamed into
/// place, so readers never observe a partial blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root_path: PathBuf = root.into();
        // Canonicalize when the directory already exists so strip_prefix
        // behaves with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            fs::create_dir_all(&root_path)?;
            fs::canonicalize(&root_path)?
        };
        Ok(Self { root })
    }

    /// Reject keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(RepositoryError::Config("unsafe blob key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(RepositoryError::Config(format!(
                "unsafe blob key [{key}]"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(RepositoryError::Config(format!(
                    "unsafe blob key: parent traversal [{key}]"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn open_for_write(&self, path: &Path, fail_if_exists: bool) -> Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let result = if fail_if_exists {
            fs::OpenOptions::new().write(true).create_new(true).open(path)
        } else {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        };
        match result {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                RepositoryError::BlobAlreadyExists(path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    fn list_recursive(
        &self,
        dir: &Path,
        prefix: &str,
        out: &mut BTreeMap<String, u64>,
    ) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), prefix, out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        out.insert(key, entry.metadata()?.len());
                    }
                }
            }
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn read_blob(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepositoryError::BlobNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_blob(
        &self,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<()> {
        let path = self.resolve(key)?;
        let mut file = self.open_for_write(&path, fail_if_exists)?;

        let mut written: u64 = 0;
        let mut buf = [0u8; WRITE_CHUNK_SIZE];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > length {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(RepositoryError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("blob [{key}] stream exceeded declared length {length}"),
                )));
            }
            file.write_all(&buf[..n])?;
        }
        if written != length {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(RepositoryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("blob [{key}] stream yielded {written} bytes, declared {length}"),
            )));
        }
        file.sync_all()?;
        Ok(())
    }

    fn write_blob_atomic(&self, key: &str, data: &[u8], fail_if_exists: bool) -> Result<()> {
        let path = self.resolve(key)?;
        if fail_if_exists && path.exists() {
            return Err(RepositoryError::BlobAlreadyExists(key.to_string()));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RepositoryError::Config(format!("unsafe blob key [{key}]")))?;
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let staging = path.with_file_name(format!(
            "{TEMP_BLOB_PREFIX}{file_name}.{}",
            hex::encode(suffix)
        ));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&staging)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        // A racing writer that created the target between the check above
        // and this rename wins; surface that as an already-exists failure.
        if fail_if_exists && path.exists() {
            let _ = fs::remove_file(&staging);
            return Err(RepositoryError::BlobAlreadyExists(key.to_string()));
        }
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn blob_exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        Self::validate_key(if prefix.is_empty() { "." } else { prefix })?;
        let mut out = BTreeMap::new();
        // Walk from the deepest directory fully contained in the prefix.
        let dir = match prefix.rfind('/') {
            Some(pos) => self.root.join(&prefix[..pos]),
            None => self.root.clone(),
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, prefix, &mut out)?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }

    fn delete_blob(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepositoryError::BlobNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_path(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
