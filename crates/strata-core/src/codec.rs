use std::io::Cursor;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use strata_storage::BlobContainer;
use strata_types::{RepositoryError, Result};

use crate::compress::{self, Compression};

/// On-blob format version; bumped only on incompatible frame changes.
const FORMAT_VERSION: u32 = 1;

/// Checksummed, self-describing framing for typed metadata blobs.
///
/// Frame layout:
///
/// ```text
/// [codec-name length: u8][codec-name bytes][version: u32 BE]
/// [compression tag: u8][payload (JSON, possibly compressed)]
/// [crc32 of everything above, widened: u64 BE]
/// ```
///
/// Reads verify the footer and header and fail with
/// [`RepositoryError::CorruptedRepository`] on any mismatch. Whether the
/// payload is compressed is decided by the tag byte alone, never by
/// configuration, so a repository can flip its `compress` setting without
/// invalidating existing blobs.
pub struct ChecksumBlobFormat<T> {
    codec: &'static str,
    /// Blob name pattern with a single `{}` placeholder for the id.
    name_format: &'static str,
    compression: Compression,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ChecksumBlobFormat<T> {
    pub fn new(codec: &'static str, name_format: &'static str, compress: bool) -> Self {
        Self {
            codec,
            name_format,
            compression: if compress {
                Compression::default()
            } else {
                Compression::None
            },
            _marker: PhantomData,
        }
    }

    /// The blob name this format uses for the given id.
    pub fn blob_name(&self, id: &str) -> String {
        self.name_format.replacen("{}", id, 1)
    }

    /// Read and verify the blob for `id` in `container`.
    pub fn read(&self, container: &BlobContainer, id: &str) -> Result<T> {
        self.read_blob(container, &self.blob_name(id))
    }

    /// Read and verify an explicitly named blob (recovery paths).
    pub fn read_blob(&self, container: &BlobContainer, name: &str) -> Result<T> {
        let bytes = container.read_blob_bytes(name)?;
        self.parse(name, &bytes)
    }

    /// Serialize and write the blob for `id`, streaming through the
    /// container's plain write path.
    pub fn write(
        &self,
        value: &T,
        container: &BlobContainer,
        id: &str,
        fail_if_exists: bool,
    ) -> Result<()> {
        let name = self.blob_name(id);
        let bytes = self.serialize(value)?;
        let length = bytes.len() as u64;
        container.write_blob(&name, &mut Cursor::new(bytes), length, fail_if_exists)
    }

    /// Serialize and write the blob for `id` atomically: durable with the
    /// full contents on success, absent on failure.
    pub fn write_atomic(
        &self,
        value: &T,
        container: &BlobContainer,
        id: &str,
        fail_if_exists: bool,
    ) -> Result<()> {
        let name = self.blob_name(id);
        let bytes = self.serialize(value)?;
        container.write_blob_atomic(&name, &bytes, fail_if_exists)
    }

    /// Delete the blob for `id`, failing if it does not exist.
    pub fn delete(&self, container: &BlobContainer, id: &str) -> Result<()> {
        let name = self.blob_name(id);
        let existed = container.blob_exists(&name)?;
        if !existed {
            return Err(RepositoryError::BlobNotFound(name));
        }
        container.delete_blob_ignoring_if_not_exists(&name)
    }

    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(value)?;
        let compressed = compress::compress(self.compression, &payload)?;

        let codec = self.codec.as_bytes();
        debug_assert!(codec.len() <= u8::MAX as usize);
        let mut out = Vec::with_capacity(1 + codec.len() + 4 + compressed.len() + 8);
        out.push(codec.len() as u8);
        out.extend_from_slice(codec);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&compressed);

        let checksum = crc32fast::hash(&out) as u64;
        out.extend_from_slice(&checksum.to_be_bytes());
        Ok(out)
    }

    fn parse(&self, name: &str, bytes: &[u8]) -> Result<T> {
        let corrupted = |reason: String| RepositoryError::CorruptedRepository {
            blob: name.to_string(),
            reason,
        };

        if bytes.len() < 1 + 4 + 1 + 8 {
            return Err(corrupted(format!("blob too short: {} bytes", bytes.len())));
        }
        let (framed, footer) = bytes.split_at(bytes.len() - 8);
        let expected = u64::from_be_bytes(footer.try_into().unwrap());
        let actual = crc32fast::hash(framed) as u64;
        if expected != actual {
            return Err(corrupted(format!(
                "checksum mismatch: stored {expected:#018x}, computed {actual:#018x}"
            )));
        }

        let codec_len = framed[0] as usize;
        if framed.len() < 1 + codec_len + 4 + 1 {
            return Err(corrupted("truncated codec header".to_string()));
        }
        let codec = &framed[1..1 + codec_len];
        if codec != self.codec.as_bytes() {
            return Err(corrupted(format!(
                "codec mismatch: expected [{}], found [{}]",
                self.codec,
                String::from_utf8_lossy(codec)
            )));
        }
        let version_bytes = &framed[1 + codec_len..1 + codec_len + 4];
        let version = u32::from_be_bytes(version_bytes.try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(corrupted(format!("unsupported format version {version}")));
        }

        let payload = compress::decompress(name, &framed[1 + codec_len + 4..])?;
        serde_json::from_slice(&payload).map_err(|e| corrupted(format!("invalid payload: {e}")))
    }
}
