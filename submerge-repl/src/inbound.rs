//! Inbound Replication Handler (F, §4.6). One task per accepted connection,
//! registered in the loader's `incoming` map under the source database id
//! (§4.4 admission invariants) and deregistered on transport error.

use crate::error::ReplError;
use std::sync::atomic::{AtomicU64, Ordering};
use submerge_base::{ChangeVector, DatabaseId, MutationKind, NodeTag};
use submerge_net::{
    BatchMessage, MessageType, ReplicationLatestEtagRequest, ReplicationMessageReply, ReplyType,
};
use submerge_store::DocumentStore;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tracks, per source database id, the highest source-assigned etag already
/// applied -- replaying a batch whose entries are all `<=` this value is a
/// no-op (§8 "Replay" law).
pub struct InboundHandler {
    pub source_database_id: DatabaseId,
    this_node_tag: NodeTag,
    last_applied_source_etag: AtomicU64,
}

impl InboundHandler {
    pub fn new(source_database_id: DatabaseId, this_node_tag: NodeTag) -> Self {
        InboundHandler {
            source_database_id,
            this_node_tag,
            last_applied_source_etag: AtomicU64::new(0),
        }
    }

    pub fn last_applied_etag(&self) -> u64 {
        self.last_applied_source_etag.load(Ordering::SeqCst)
    }

    /// Runs the negotiate-then-receive-loop over an already-accepted
    /// connection whose `ReplicationLatestEtagRequest` has already been
    /// read by the caller (the TCP listener must read the connection
    /// header and the etag request before it knows which source this
    /// connection is, so admission happens before this method is called).
    pub async fn serve<S, D>(
        &self,
        request: ReplicationLatestEtagRequest,
        reader: &mut submerge_net::FrameReader<tokio::io::ReadHalf<S>>,
        writer: &mut submerge_net::FrameWriter<tokio::io::WriteHalf<S>>,
        store: &D,
    ) -> Result<(), ReplError>
    where
        S: AsyncRead + AsyncWrite,
        D: DocumentStore,
    {
        let _ = request;
        self.respond_current_state(writer, store).await?;

        loop {
            let batch: BatchMessage = reader.read_json().await.map_err(|e| ReplError::Transport {
                destination: self.source_database_id.to_string(),
                source: e,
            })?;
            self.apply_batch(&batch, store)?;
            self.respond_current_state(writer, store).await?;
        }
    }

    fn apply_batch<D: DocumentStore>(&self, batch: &BatchMessage, store: &D) -> Result<(), ReplError> {
        let mut applied_through = self.last_applied_source_etag.load(Ordering::SeqCst);
        for item in &batch.items {
            if item.etag <= applied_through {
                continue; // already applied: replay is a no-op (§8).
            }
            store
                .put(item.kind, &item.id, item.payload.clone(), Some(&item.change_vector))
                .map_err(|e| ReplError::Fatal {
                    database: self.source_database_id.clone(),
                    message: e.to_string(),
                })?;
            applied_through = item.etag;
        }
        self.last_applied_source_etag.store(applied_through.max(batch.last_etag_in_batch), Ordering::SeqCst);
        Ok(())
    }

    async fn respond_current_state<S, D>(
        &self,
        writer: &mut submerge_net::FrameWriter<tokio::io::WriteHalf<S>>,
        store: &D,
    ) -> Result<(), ReplError>
    where
        S: AsyncWrite,
        D: DocumentStore,
    {
        let change_vector = store
            .index()
            .scan_all(MutationKind::Document, 0)
            .ok()
            .and_then(|entries| entries.last().map(|e| e.change_vector.clone()))
            .unwrap_or_else(ChangeVector::new);

        let reply = ReplicationMessageReply {
            reply_type: ReplyType::Ok,
            message_type: MessageType::Heartbeat,
            last_etag_accepted: self.last_applied_etag(),
            node_tag: self.this_node_tag.clone(),
            database_change_vector: change_vector,
            exception: None,
        };
        writer.write_json(&reply).await.map_err(|e| ReplError::Transport {
            destination: self.source_database_id.to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use submerge_base::ChangeVector as CV;
    use submerge_net::WireChangeLogEntry;
    use submerge_store::{ChangeLogIndex, MemoryDocumentStore};

    fn handler() -> InboundHandler {
        InboundHandler::new(DatabaseId::from("source-db"), NodeTag::from("A"))
    }

    fn store() -> MemoryDocumentStore {
        MemoryDocumentStore::new(DatabaseId::from("db-a"), ChangeLogIndex::in_memory().unwrap())
    }

    #[test]
    fn apply_batch_is_idempotent_under_replay() {
        let h = handler();
        let s = store();
        let batch = BatchMessage {
            items: vec![WireChangeLogEntry {
                kind: MutationKind::Document,
                bucket: 1,
                etag: 5,
                id: "users/1".into(),
                change_vector: CV::new(),
                payload: b"{}".to_vec(),
            }],
            last_etag_in_batch: 5,
        };
        h.apply_batch(&batch, &s).unwrap();
        assert_eq!(h.last_applied_etag(), 5);
        let count_after_first = s.index().scan_all(MutationKind::Document, 0).unwrap().len();

        h.apply_batch(&batch, &s).unwrap(); // replay
        let count_after_replay = s.index().scan_all(MutationKind::Document, 0).unwrap().len();
        assert_eq!(count_after_first, count_after_replay);
    }
}
