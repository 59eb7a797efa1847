pub mod file_info;
pub mod status;
pub mod store;

pub use file_info::{canonical_blob_name, FileInfo, ShardSnapshot, ShardSnapshots, SnapshotFiles};
pub use status::{ShardSnapshotStatus, Stage, StatusSummary};
pub use store::{FsShardStore, RecoveryState, ShardCommit, ShardStore, StoreFileMetadata};
