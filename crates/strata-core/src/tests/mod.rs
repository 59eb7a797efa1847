mod repository_data;
mod shard_create;
