use serde::{Deserialize, Serialize};

/// The seven mutation classes the change log partitions every write into
/// (§3). Shared by the storage, wire, replication and subscription crates so
/// that `scan_by_bucket`'s `kind` argument and the wire `BatchMessage`'s
/// per-item tag always agree bit-for-bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Document,
    Tombstone,
    Conflict,
    Revision,
    Attachment,
    Counter,
    TimeSeriesSegment,
}

impl MutationKind {
    pub const ALL: [MutationKind; 7] = [
        MutationKind::Document,
        MutationKind::Tombstone,
        MutationKind::Conflict,
        MutationKind::Revision,
        MutationKind::Attachment,
        MutationKind::Counter,
        MutationKind::TimeSeriesSegment,
    ];
}
