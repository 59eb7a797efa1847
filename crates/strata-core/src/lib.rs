pub mod codec;
pub mod compress;
pub mod config;
pub mod exec;
pub mod metadata;
pub mod repository;
pub mod repository_data;
pub mod shard;
pub mod stream;
pub mod throttle;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;

pub use repository::{BlobStoreRepository, BlobStoreFactory};
pub use repository_data::{RepositoryData, EMPTY_GEN};
