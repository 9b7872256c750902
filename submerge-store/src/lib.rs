//! Bucket Mapper (A) and Change Log Index (B), plus a minimal reference
//! `DocumentStore` sufficient to exercise the replication and subscription
//! engines end-to-end: a BTree planner and executor over `redb`.

mod bucket;
mod change_log;
mod document_store;
mod index;

pub use bucket::{
    bucket_of, shard_of, BucketMigration, BucketMigrations, MigrationStatus, ShardForWrite,
    ShardId, ShardRange, BUCKET_COUNT,
};
pub use change_log::{ChangeLogEntry, PayloadRef};
pub use document_store::{DocumentStore, MemoryDocumentStore};
pub use index::{ChangeLogIndex, Result, StoreError};
