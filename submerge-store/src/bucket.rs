//! Bucket Mapper (§4.1). Deterministic, cross-language-stable routing from a
//! document id to a bucket, and from a bucket to the shard that currently
//! owns it.

use serde::{Deserialize, Serialize};

/// Bucket ids live in `[0, 2^20)` (§3).
pub const BUCKET_COUNT: u32 = 1 << 20;

const ROUTING_SEPARATOR: char = '$';

/// Maps a document id to its routing key: the full id, or the segment after
/// the last `$` when the id contains one (`users/7$tenantA` routes by
/// `tenantA`).
fn routing_key(id: &str) -> &str {
    match id.rfind(ROUTING_SEPARATOR) {
        Some(pos) => &id[pos + 1..],
        None => id,
    }
}

/// `bucket_of` — stable 64-bit hash of the routing key, reduced modulo the
/// bucket count. Must be byte-for-byte reproducible across nodes and
/// language implementations, so the hash is fixed (rapidhash with a fixed
/// seed) and the reduction is a plain `% BUCKET_COUNT`, never a
/// power-of-two mask shortcut that would be sensitive to `BUCKET_COUNT`
/// changing shape.
pub fn bucket_of(id: &str) -> u32 {
    let key = routing_key(id);
    let hash = rapidhash::rapidhash(key.as_bytes());
    (hash % BUCKET_COUNT as u64) as u32
}

pub type ShardId = u32;

/// A half-open `[lo, hi)` interval of bucket ids owned by `shard`. Ranges
/// partition the bucket space and are kept sorted by `lo`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ShardRange {
    pub lo: u32,
    pub hi: u32,
    pub shard: ShardId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Moving,
    OwnershipTransferred,
    Finalized,
}

/// An in-flight bucket migration: `bucket` is temporarily owned by both
/// `source` and `destination`. At most one migration per bucket at any time
/// (enforced by `BucketMigrations::start`, not by this type).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketMigration {
    pub bucket: u32,
    pub source: ShardId,
    pub destination: ShardId,
    pub status: MigrationStatus,
}

#[derive(Debug, Default, Clone)]
pub struct BucketMigrations {
    by_bucket: std::collections::HashMap<u32, BucketMigration>,
}

impl BucketMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Err` if `bucket` already has an active migration — at most
    /// one migration per bucket at any time (§3).
    pub fn start(
        &mut self,
        bucket: u32,
        source: ShardId,
        destination: ShardId,
    ) -> Result<(), submerge_base::Error> {
        if self.by_bucket.contains_key(&bucket) {
            return Err(submerge_base::err(format!(
                "bucket {bucket} already has an active migration"
            )));
        }
        self.by_bucket.insert(
            bucket,
            BucketMigration {
                bucket,
                source,
                destination,
                status: MigrationStatus::Moving,
            },
        );
        Ok(())
    }

    pub fn advance(&mut self, bucket: u32, status: MigrationStatus) {
        if let Some(m) = self.by_bucket.get_mut(&bucket) {
            m.status = status;
        }
    }

    pub fn finish(&mut self, bucket: u32) {
        self.by_bucket.remove(&bucket);
    }

    pub fn get(&self, bucket: u32) -> Option<&BucketMigration> {
        self.by_bucket.get(&bucket)
    }
}

/// `shard_of` — looks up the range whose `lo` is the greatest value `<=
/// bucket` (ranges are kept sorted by `lo`; this is a tie-break rule, not an
/// ambiguity: exactly one range ever satisfies it for a well-formed
/// partition). During an active migration, reads may be served from either
/// source or destination; writes go to source until `OwnershipTransferred`,
/// then destination.
pub fn shard_of(bucket: u32, ranges: &[ShardRange], migrations: &BucketMigrations) -> ShardForWrite {
    let base = ranges
        .iter()
        .filter(|r| r.lo <= bucket)
        .max_by_key(|r| r.lo)
        .map(|r| r.shard)
        .expect("ranges must partition the full bucket space");

    match migrations.get(bucket) {
        None => ShardForWrite {
            write: base,
            read_candidates: vec![base],
        },
        Some(m) => match m.status {
            MigrationStatus::Moving => ShardForWrite {
                write: m.source,
                read_candidates: vec![m.source, m.destination],
            },
            MigrationStatus::OwnershipTransferred | MigrationStatus::Finalized => ShardForWrite {
                write: m.destination,
                read_candidates: vec![m.source, m.destination],
            },
        },
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ShardForWrite {
    pub write: ShardId,
    pub read_candidates: Vec<ShardId>,
}
