use serde::{Deserialize, Serialize};
use submerge_base::{ChangeVector, MutationKind};

/// Opaque pointer into the underlying store (§3: "payload_ref: opaque
/// pointer into the underlying store"). The durable storage layout that
/// pointer addresses is an explicit non-goal of this engine; this crate
/// only needs `PayloadRef` to round-trip through the index and to be
/// resolvable back to bytes when an outbound worker needs to ship the
/// entry, which `payload.rs` provides.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PayloadRef(pub u64);

/// Common header for every indexed mutation (§3). `(kind, etag)` is unique
/// and strictly increasing per node; the bucket of an entry equals
/// `bucket_of(id)` for the entry's whole lifetime.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub kind: MutationKind,
    pub bucket: u32,
    pub etag: u64,
    pub id: String,
    pub change_vector: ChangeVector,
    pub payload_ref: PayloadRef,
}
