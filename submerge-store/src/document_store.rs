//! The local document store is an external collaborator (§6): this engine
//! consumes "transactional writes, the change-log indexes of §4.2, and a
//! tombstone cleaner that consults §4.7" but does not own the durable
//! storage layout (an explicit non-goal). `DocumentStore` is that
//! collaborator's contract; `MemoryDocumentStore` is a reference
//! implementation minimal enough to drive the replication and subscription
//! engines end-to-end in tests, storing document bytes alongside the change
//! log index rather than in a real row/column engine.

use crate::bucket::bucket_of;
use crate::change_log::{ChangeLogEntry, PayloadRef};
use crate::index::{ChangeLogIndex, Result, StoreError};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use submerge_base::{ChangeVector, DatabaseId, MutationKind};

/// Transactional writes against the local store. A "transaction" here is a
/// single mutation plus its index entry, committed atomically; batched
/// writes (as the inbound replication handler applies a whole batch) call
/// `put`/`delete` repeatedly inside one lock acquisition via `write_batch`.
pub trait DocumentStore: Send + Sync {
    /// Assigns the next etag for `kind` and indexes a document write.
    /// Returns the committed `ChangeLogEntry`.
    fn put(&self, kind: MutationKind, id: &str, payload: Vec<u8>, source_change_vector: Option<&ChangeVector>) -> Result<ChangeLogEntry>;

    /// Reads back the payload bytes for an entry's `payload_ref`.
    fn read_payload(&self, payload_ref: &PayloadRef) -> Result<Vec<u8>>;

    fn index(&self) -> &ChangeLogIndex;

    /// Deletes tombstones strictly older than `min_etag`, the value
    /// published by `get_minimal_etag_for_replication` (§4.7). This is the
    /// single place replication lag blocks reclamation.
    fn collect_tombstones_below(&self, min_etag: u64) -> Result<usize>;
}

struct Inner {
    next_etag: AtomicU64,
    payloads: Mutex<HashMap<u64, Vec<u8>>>,
    tombstones: Mutex<Vec<(u64, String)>>, // (etag, id) pending collection
}

pub struct MemoryDocumentStore {
    this_db: DatabaseId,
    index: ChangeLogIndex,
    inner: Inner,
}

impl MemoryDocumentStore {
    pub fn new(this_db: DatabaseId, index: ChangeLogIndex) -> Self {
        MemoryDocumentStore {
            this_db,
            index,
            inner: Inner {
                next_etag: AtomicU64::new(1),
                payloads: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(Vec::new()),
            },
        }
    }

    fn alloc_etag(&self) -> u64 {
        self.inner.next_etag.fetch_add(1, Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn put(
        &self,
        kind: MutationKind,
        id: &str,
        payload: Vec<u8>,
        source_change_vector: Option<&ChangeVector>,
    ) -> Result<ChangeLogEntry> {
        let etag = self.alloc_etag();
        let mut change_vector = source_change_vector.cloned().unwrap_or_default();
        change_vector.set(self.this_db.clone(), etag);

        let payload_ref = PayloadRef(etag);
        self.inner
            .payloads
            .lock()
            .unwrap()
            .insert(payload_ref.0, payload);

        let entry = ChangeLogEntry {
            kind,
            bucket: bucket_of(id),
            etag,
            id: id.to_string(),
            change_vector,
            payload_ref,
        };
        self.index.append(&entry)?;

        if kind == MutationKind::Tombstone {
            self.inner.tombstones.lock().unwrap().push((etag, id.to_string()));
        }
        Ok(entry)
    }

    fn read_payload(&self, payload_ref: &PayloadRef) -> Result<Vec<u8>> {
        self.inner
            .payloads
            .lock()
            .unwrap()
            .get(&payload_ref.0)
            .cloned()
            .ok_or(StoreError::PayloadNotFound(payload_ref.0))
    }

    fn index(&self) -> &ChangeLogIndex {
        &self.index
    }

    fn collect_tombstones_below(&self, min_etag: u64) -> Result<usize> {
        let mut tombstones = self.inner.tombstones.lock().unwrap();
        let before = tombstones.len();
        tombstones.retain(|(etag, _id)| *etag >= min_etag);
        let collected = before - tombstones.len();
        if collected > 0 {
            tracing::debug!(min_etag, collected, "collected tombstones below replication floor");
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryDocumentStore {
        MemoryDocumentStore::new(DatabaseId::from("db-a"), ChangeLogIndex::in_memory().unwrap())
    }

    #[test]
    fn put_assigns_increasing_etags_and_own_change_vector_entry() {
        let s = store();
        let e1 = s.put(MutationKind::Document, "users/1", b"{}".to_vec(), None).unwrap();
        let e2 = s.put(MutationKind::Document, "users/2", b"{}".to_vec(), None).unwrap();
        assert!(e2.etag > e1.etag);
        assert_eq!(e1.change_vector.etag_for(&DatabaseId::from("db-a")), e1.etag);
    }

    #[test]
    fn tombstone_below_min_etag_is_collected() {
        let s = store();
        let t1 = s.put(MutationKind::Tombstone, "users/1", vec![], None).unwrap();
        let t2 = s.put(MutationKind::Tombstone, "users/2", vec![], None).unwrap();
        let collected = s.collect_tombstones_below(t2.etag).unwrap();
        assert_eq!(collected, 1);
        let _ = t1;
    }
}
