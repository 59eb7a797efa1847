pub mod error;
pub mod index_id;
pub mod snapshot_id;

pub use error::{RepositoryError, Result};
pub use index_id::{IndexId, ShardId};
pub use snapshot_id::SnapshotId;

use rand::RngCore;

/// Generate an opaque repository UUID: 16 random bytes, hex-encoded.
///
/// Used for snapshot ids, index ids, data-blob names, and verification
/// seeds. The encoding is filename-safe on every supported blob store.
pub fn random_uuid() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
