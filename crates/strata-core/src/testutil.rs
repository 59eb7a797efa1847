use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use strata_storage::{BlobPath, BlobStore};
use strata_types::{RepositoryError, Result, ShardId};

use crate::config::RepositorySettings;
use crate::exec::{Completion, ThreadPool};
use crate::repository::BlobStoreRepository;
use crate::shard::store::VerifyingInput;
use crate::shard::{ShardCommit, ShardStore, StoreFileMetadata};

/// In-memory blob store for tests. Atomic writes really are atomic (CAS
/// under the map lock), which the concurrent-finalize tests rely on.
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    listing_unsupported: AtomicBool,
    close_count: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blobs: Mutex::new(BTreeMap::new()),
            listing_unsupported: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn set_listing_unsupported(&self, unsupported: bool) {
        self.listing_unsupported
            .store(unsupported, Ordering::Release);
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }

    pub fn put_raw(&self, key: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(key.to_string(), data);
    }
}

impl BlobStore for MemoryBlobStore {
    fn read_blob(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        match self.blobs.lock().unwrap().get(key) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(RepositoryError::BlobNotFound(key.to_string())),
        }
    }

    fn write_blob(
        &self,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        fail_if_exists: bool,
    ) -> Result<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        if buf.len() as u64 != length {
            return Err(RepositoryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "blob [{key}] stream yielded {} bytes, declared {length}",
                    buf.len()
                ),
            )));
        }
        let mut blobs = self.blobs.lock().unwrap();
        if fail_if_exists && blobs.contains_key(key) {
            return Err(RepositoryError::BlobAlreadyExists(key.to_string()));
        }
        blobs.insert(key.to_string(), buf);
        Ok(())
    }

    fn write_blob_atomic(&self, key: &str, data: &[u8], fail_if_exists: bool) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        if fail_if_exists && blobs.contains_key(key) {
            return Err(RepositoryError::BlobAlreadyExists(key.to_string()));
        }
        blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn blob_exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(key))
    }

    fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        if self.listing_unsupported.load(Ordering::Acquire) {
            return Err(RepositoryError::ListUnsupported);
        }
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| (key.clone(), data.len() as u64))
            .collect())
    }

    fn delete_blob(&self, key: &str) -> Result<()> {
        match self.blobs.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::BlobNotFound(key.to_string())),
        }
    }

    fn delete_path(&self, path: &str) -> Result<()> {
        let prefix = format!("{path}/");
        self.blobs
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Repository over a fresh [`MemoryBlobStore`] with default settings.
pub fn memory_repository(
    name: &str,
) -> (Arc<BlobStoreRepository>, Arc<MemoryBlobStore>, Arc<ThreadPool>) {
    memory_repository_with(name, RepositorySettings::default())
}

pub fn memory_repository_with(
    name: &str,
    settings: RepositorySettings,
) -> (Arc<BlobStoreRepository>, Arc<MemoryBlobStore>, Arc<ThreadPool>) {
    let store = MemoryBlobStore::new();
    let pool = ThreadPool::new(2, 2);
    let factory_store = Arc::clone(&store);
    let repository = Arc::new(BlobStoreRepository::new(
        name,
        settings,
        BlobPath::root(),
        Arc::clone(&pool),
        Box::new(move || Ok(Arc::clone(&factory_store) as Arc<dyn BlobStore>)),
    ));
    repository.start().expect("failed to start test repository");
    (repository, store, pool)
}

/// A completion sink paired with the receiver its result arrives on.
pub fn completion_channel<T: Send + 'static>() -> (Completion<T>, Receiver<Result<T>>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

pub fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

type ReadHook = Box<dyn FnMut(u64) + Send>;

/// In-memory shard store. The read hook observes cumulative bytes read
/// per open stream, which the cancellation tests use to flip the abort
/// flag mid-upload.
pub struct MemShardStore {
    shard_id: ShardId,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    refs: AtomicI64,
    corrupted: Mutex<Option<String>>,
    read_hook: Arc<Mutex<Option<ReadHook>>>,
}

impl MemShardStore {
    pub fn new(shard_id: ShardId) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            files: Mutex::new(BTreeMap::new()),
            refs: AtomicI64::new(0),
            corrupted: Mutex::new(None),
            read_hook: Arc::new(Mutex::new(None)),
        })
    }

    pub fn put_file(&self, name: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(name.to_string(), data);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    /// Flip one byte so the advertised checksum no longer matches.
    pub fn corrupt_file(&self, name: &str) {
        let mut files = self.files.lock().unwrap();
        let data = files.get_mut(name).expect("no such file");
        data[0] ^= 0xFF;
    }

    pub fn metadata(&self, name: &str) -> StoreFileMetadata {
        let files = self.files.lock().unwrap();
        let data = files.get(name).expect("no such file");
        StoreFileMetadata {
            name: name.to_string(),
            length: data.len() as u64,
            checksum: crc32_hex(data),
        }
    }

    pub fn commit(&self, generation: i64) -> ShardCommit {
        let names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        ShardCommit {
            generation,
            files: names.iter().map(|name| self.metadata(name)).collect(),
        }
    }

    pub fn set_read_hook(&self, hook: ReadHook) {
        *self.read_hook.lock().unwrap() = Some(hook);
    }

    pub fn is_marked_corrupted(&self) -> bool {
        self.corrupted.lock().unwrap().is_some()
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }
}

impl ShardStore for MemShardStore {
    fn shard_id(&self) -> ShardId {
        self.shard_id.clone()
    }

    fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn open_verifying_input(&self, file: &StoreFileMetadata) -> Result<Box<dyn VerifyingInput>> {
        let data = self
            .files
            .lock()
            .unwrap()
            .get(&file.name)
            .cloned()
            .ok_or_else(|| RepositoryError::BlobNotFound(file.name.clone()))?;
        Ok(Box::new(HookedRead {
            cursor: Cursor::new(data),
            expected: file.clone(),
            hasher: crc32fast::Hasher::new(),
            read_bytes: 0,
            hook: Arc::clone(&self.read_hook),
        }))
    }

    fn restore_file(&self, file: &StoreFileMetadata, data: &mut dyn Read) -> Result<u64> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let actual = crc32_hex(&buf);
        if buf.len() as u64 != file.length || actual != file.checksum {
            return Err(RepositoryError::ChecksumMismatch {
                name: file.name.clone(),
                expected: format!("{}:{}", file.length, file.checksum),
                actual: format!("{}:{}", buf.len(), actual),
            });
        }
        let written = buf.len() as u64;
        self.files.lock().unwrap().insert(file.name.clone(), buf);
        Ok(written)
    }

    fn mark_corrupted(&self, reason: &str) {
        let mut corrupted = self.corrupted.lock().unwrap();
        if corrupted.is_none() {
            *corrupted = Some(reason.to_string());
        }
    }
}

struct HookedRead {
    cursor: Cursor<Vec<u8>>,
    expected: StoreFileMetadata,
    hasher: crc32fast::Hasher,
    read_bytes: u64,
    hook: Arc<Mutex<Option<ReadHook>>>,
}

impl Read for HookedRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Small reads so tests can observe progress at part granularity.
        let cap = buf.len().min(1024);
        let n = self.cursor.read(&mut buf[..cap])?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.read_bytes += n as u64;
            if let Some(hook) = self.hook.lock().unwrap().as_mut() {
                hook(self.read_bytes);
            }
        }
        Ok(n)
    }
}

impl VerifyingInput for HookedRead {
    fn verify(&self) -> Result<()> {
        let actual = format!("{:08x}", self.hasher.clone().finalize());
        if self.read_bytes != self.expected.length || actual != self.expected.checksum {
            return Err(RepositoryError::ChecksumMismatch {
                name: self.expected.name.clone(),
                expected: format!("{}:{}", self.expected.length, self.expected.checksum),
                actual: format!("{}:{}", self.read_bytes, actual),
            });
        }
        Ok(())
    }
}
