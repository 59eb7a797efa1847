use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use strata_types::{RepositoryError, Result, ShardId};

/// Identity of one physical file in a shard store: the content key used
/// for deduplication across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    pub name: String,
    pub length: u64,
    pub checksum: String,
}

/// The set of files forming one consistent point-in-time view of a shard,
/// as handed to the snapshot creator by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCommit {
    pub generation: i64,
    pub files: Vec<StoreFileMetadata>,
}

/// A readable stream whose producer can attest, after the stream has been
/// fully drained, that the bytes matched the advertised checksum.
pub trait VerifyingInput: Read + Send {
    fn verify(&self) -> Result<()>;
}

/// Local shard store as seen by the snapshot creator and restore engine.
///
/// Reference counting pins the underlying files while uploads read them.
pub trait ShardStore: Send + Sync {
    fn shard_id(&self) -> ShardId;

    fn inc_ref(&self);

    fn dec_ref(&self);

    /// Open a file for reading; [`VerifyingInput::verify`] reports whether
    /// the drained bytes matched `file`'s length and checksum.
    fn open_verifying_input(&self, file: &StoreFileMetadata) -> Result<Box<dyn VerifyingInput>>;

    /// Write one restored file, verifying length and checksum; a partial
    /// or mismatching file must not survive.
    fn restore_file(&self, file: &StoreFileMetadata, data: &mut dyn Read) -> Result<u64>;

    /// Record that corrupted data was read from this store. Called by the
    /// creator before surfacing a checksum failure.
    fn mark_corrupted(&self, reason: &str);
}

// ---------------------------------------------------------------------------
// Recovery observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileRecovery {
    pub length: u64,
    pub recovered: u64,
}

/// Progress observer driven by the restore engine.
#[derive(Debug, Default)]
pub struct RecoveryState {
    files: Mutex<BTreeMap<String, FileRecovery>>,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, name: &str, length: u64) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), FileRecovery {
                length,
                recovered: 0,
            });
    }

    pub fn add_recovered_bytes(&self, name: &str, bytes: u64) {
        if let Some(file) = self.files.lock().unwrap().get_mut(name) {
            file.recovered += bytes;
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.lock().unwrap().values().map(|f| f.length).sum()
    }

    pub fn recovered_bytes(&self) -> u64 {
        self.files
            .lock()
            .unwrap()
            .values()
            .map(|f| f.recovered)
            .sum()
    }

    pub fn file(&self, name: &str) -> Option<FileRecovery> {
        self.files.lock().unwrap().get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Filesystem shard store
// ---------------------------------------------------------------------------

const RESTORE_COPY_CHUNK: usize = 64 * 1024;

/// Shard store over a local directory, checksumming files with CRC32.
pub struct FsShardStore {
    shard_id: ShardId,
    root: PathBuf,
    refs: AtomicI64,
    corrupted: Mutex<Option<String>>,
}

impl FsShardStore {
    pub fn new(shard_id: ShardId, root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            shard_id,
            root,
            refs: AtomicI64::new(0),
            corrupted: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Snapshot the current directory contents as a commit descriptor.
    pub fn read_commit(&self, generation: i64) -> Result<ShardCommit> {
        let mut files = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(&self.root)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = self.file_metadata(&name)?;
            files.push(metadata);
        }
        Ok(ShardCommit { generation, files })
    }

    pub fn file_metadata(&self, name: &str) -> Result<StoreFileMetadata> {
        let path = self.root.join(name);
        let mut file = fs::File::open(&path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut length: u64 = 0;
        let mut buf = [0u8; RESTORE_COPY_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            length += n as u64;
            hasher.update(&buf[..n]);
        }
        Ok(StoreFileMetadata {
            name: name.to_string(),
            length,
            checksum: format!("{:08x}", hasher.finalize()),
        })
    }

    pub fn is_marked_corrupted(&self) -> bool {
        self.corrupted.lock().unwrap().is_some()
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }
}

impl ShardStore for FsShardStore {
    fn shard_id(&self) -> ShardId {
        self.shard_id.clone()
    }

    fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced dec_ref");
    }

    fn open_verifying_input(&self, file: &StoreFileMetadata) -> Result<Box<dyn VerifyingInput>> {
        let path = self.root.join(&file.name);
        let inner = fs::File::open(&path)?;
        Ok(Box::new(ChecksumRead {
            inner,
            expected: file.clone(),
            hasher: Mutex::new(ChecksumState {
                hasher: crc32fast::Hasher::new(),
                length: 0,
            }),
        }))
    }

    fn restore_file(&self, file: &StoreFileMetadata, data: &mut dyn Read) -> Result<u64> {
        let path = self.root.join(&file.name);
        let mut out = fs::File::create(&path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut written: u64 = 0;
        let mut buf = [0u8; RESTORE_COPY_CHUNK];
        let result = loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(RepositoryError::Io(e)),
            };
            written += n as u64;
            hasher.update(&buf[..n]);
            if let Err(e) = out.write_all(&buf[..n]) {
                break Err(RepositoryError::Io(e));
            }
        };
        if let Err(e) = result {
            drop(out);
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let actual = format!("{:08x}", hasher.finalize());
        if written != file.length || actual != file.checksum {
            drop(out);
            let _ = fs::remove_file(&path);
            return Err(RepositoryError::ChecksumMismatch {
                name: file.name.clone(),
                expected: format!("{}:{}", file.length, file.checksum),
                actual: format!("{written}:{actual}"),
            });
        }
        out.sync_all()?;
        Ok(written)
    }

    fn mark_corrupted(&self, reason: &str) {
        warn!(shard = %self.shard_id, reason, "marking shard store corrupted");
        let mut corrupted = self.corrupted.lock().unwrap();
        if corrupted.is_none() {
            *corrupted = Some(reason.to_string());
        }
    }
}

struct ChecksumState {
    hasher: crc32fast::Hasher,
    length: u64,
}

/// File reader that accumulates a CRC32 while being drained; `verify`
/// checks the digest against the advertised metadata.
struct ChecksumRead {
    inner: fs::File,
    expected: StoreFileMetadata,
    hasher: Mutex<ChecksumState>,
}

impl Read for ChecksumRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let mut state = self.hasher.lock().unwrap();
            state.hasher.update(&buf[..n]);
            state.length += n as u64;
        }
        Ok(n)
    }
}

impl VerifyingInput for ChecksumRead {
    fn verify(&self) -> Result<()> {
        let state = self.hasher.lock().unwrap();
        let actual = format!("{:08x}", state.hasher.clone().finalize());
        if state.length != self.expected.length || actual != self.expected.checksum {
            return Err(RepositoryError::ChecksumMismatch {
                name: self.expected.name.clone(),
                expected: format!("{}:{}", self.expected.length, self.expected.checksum),
                actual: format!("{}:{}", state.length, actual),
            });
        }
        Ok(())
    }
}
