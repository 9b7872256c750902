//! Outbound Replication Worker (E, §4.5). One worker per destination, one
//! `tokio` task per worker (§5): negotiate, then alternate "read a batch
//! from the store / write it / await the ack" over a real framed TCP
//! connection.

use crate::error::ReplError;
use crate::shutdown_tracker::ConnectionShutdownInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use submerge_base::{ChangeVector, DatabaseId, MutationKind, NodeTag};
use submerge_net::{
    BatchMessage, MessageType, Operation, ReplicationLatestEtagRequest, ReplicationMessageReply,
    ReplyType, TcpConnectionHeader, WireChangeLogEntry, PROTOCOL_VERSION,
};
use submerge_store::DocumentStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutboundState {
    NotStarted,
    Connecting,
    Negotiating,
    Streaming,
    Idle,
    Reconnecting,
    Closed,
}

pub const MAX_BATCH_ITEMS: usize = 512;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration that the reconciler can mutate in place (§4.4 step 5)
/// without tearing the worker down.
pub struct OutboundTunables {
    pub delay_replication_for: Duration,
    pub mentor_node: Option<NodeTag>,
}

pub struct OutboundWorker {
    pub destination_name: String,
    pub target_database: DatabaseId,
    this_node_tag: NodeTag,
    this_database_id: DatabaseId,
    state: Mutex<OutboundState>,
    tunables: Mutex<OutboundTunables>,
    next_replicate_at: Mutex<Instant>,
    shutdown: Mutex<ConnectionShutdownInfo>,
    last_send_etag: AtomicU64,
    acked: std::sync::atomic::AtomicBool,
    pub disabled: std::sync::atomic::AtomicBool,
    pub cancel: CancellationToken,
}

impl OutboundWorker {
    pub fn new(
        destination_name: String,
        target_database: DatabaseId,
        this_node_tag: NodeTag,
        this_database_id: DatabaseId,
        max_timeout_cap: Duration,
    ) -> Self {
        OutboundWorker {
            destination_name,
            target_database,
            this_node_tag,
            this_database_id,
            state: Mutex::new(OutboundState::NotStarted),
            tunables: Mutex::new(OutboundTunables {
                delay_replication_for: Duration::ZERO,
                mentor_node: None,
            }),
            next_replicate_at: Mutex::new(Instant::now()),
            shutdown: Mutex::new(ConnectionShutdownInfo::new(max_timeout_cap)),
            last_send_etag: AtomicU64::new(0),
            acked: std::sync::atomic::AtomicBool::new(false),
            disabled: std::sync::atomic::AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> OutboundState {
        *self.state.lock().unwrap()
    }

    pub fn has_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    fn set_state(&self, s: OutboundState) {
        tracing::debug!(destination = %self.destination_name, state = ?s, "outbound worker state transition");
        *self.state.lock().unwrap() = s;
    }

    pub fn last_sent_etag(&self) -> u64 {
        self.last_send_etag.load(Ordering::SeqCst)
    }

    /// Applies a reconciler update to delay/mentor in place; if the delay
    /// changed, the next-replicate timestamp is reset so the new value
    /// takes effect immediately (§4.4 step 5, §4.5 delay semantics).
    pub fn apply_tunables(&self, delay_replication_for: Duration, mentor_node: Option<NodeTag>) {
        let mut t = self.tunables.lock().unwrap();
        if t.delay_replication_for != delay_replication_for {
            *self.next_replicate_at.lock().unwrap() = Instant::now();
        }
        t.delay_replication_for = delay_replication_for;
        t.mentor_node = mentor_node;
    }

    pub fn shutdown_info(&self) -> std::sync::MutexGuard<'_, ConnectionShutdownInfo> {
        self.shutdown.lock().unwrap()
    }

    /// Runs the full worker lifecycle over an already-connected transport:
    /// handshake, then streaming until cancelled or a fatal error. Generic
    /// over the stream so tests can drive it with `tokio::io::duplex`
    /// instead of a real socket.
    pub async fn run<S, D>(&self, stream: S, store: &D) -> Result<(), ReplError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: DocumentStore,
    {
        self.set_state(OutboundState::Connecting);
        let (mut reader, mut writer) = submerge_net::split(stream);

        self.set_state(OutboundState::Negotiating);
        let header = TcpConnectionHeader {
            operation: Operation::Replication,
            protocol_version: PROTOCOL_VERSION,
            database: self.target_database.to_string(),
        };
        writer
            .write_json(&header)
            .await
            .map_err(|e| transport_err(&self.destination_name, e))?;

        let request = ReplicationLatestEtagRequest {
            source_node_tag: self.this_node_tag.clone(),
            source_machine_name: self.this_node_tag.to_string(),
            source_database_id: self.this_database_id.clone(),
            source_database_name: self.this_database_id.to_string(),
            source_url: String::new(),
            last_sent_etag: self.last_sent_etag(),
        };
        writer
            .write_json(&request)
            .await
            .map_err(|e| transport_err(&self.destination_name, e))?;

        let reply: ReplicationMessageReply = reader
            .read_json()
            .await
            .map_err(|e| transport_err(&self.destination_name, e))?;
        validate_reply(&self.destination_name, &reply)?;
        if reply.node_tag == self.this_node_tag {
            // Supplemented feature (see DESIGN.md): the destination's
            // handshake reply identifies it as this same node -- the
            // connection string resolved back to our own replica. Treated
            // the same way an inbound connection rejects a source whose
            // database id is our own (§4.4 admission invariants), just
            // detected from the other end of the link.
            self.set_state(OutboundState::Closed);
            return Err(ReplError::Fatal {
                database: self.target_database.clone(),
                message: format!("destination '{}' resolves back to this node", self.destination_name),
            });
        }
        self.last_send_etag.store(reply.last_etag_accepted, Ordering::SeqCst);
        self.acked.store(true, Ordering::SeqCst);

        self.shutdown.lock().unwrap().reset();
        self.set_state(OutboundState::Streaming);

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(OutboundState::Closed);
                return Ok(());
            }

            let delay = self.tunables.lock().unwrap().delay_replication_for;
            let cutoff = if delay.is_zero() {
                u64::MAX
            } else {
                0 // non-zero delay excludes entries younger than `now - d`; the
                  // reference store has no write-timestamp index, so a non-zero
                  // delay degrades to "send nothing yet" until one is added.
            };

            let from = self.last_sent_etag();
            let entries = store
                .index()
                .scan_all(MutationKind::Document, from)
                .map_err(|e| ReplError::Fatal {
                    database: self.this_database_id.clone(),
                    message: e.to_string(),
                })?;
            let entries: Vec<_> = entries.into_iter().filter(|e| e.etag <= cutoff || cutoff == u64::MAX).collect();

            if entries.is_empty() {
                self.set_state(OutboundState::Idle);
                let wait = tokio::time::sleep(HEARTBEAT_INTERVAL);
                tokio::select! {
                    _ = wait => {
                        let heartbeat = ReplicationMessageReply {
                            reply_type: ReplyType::Ok,
                            message_type: MessageType::Heartbeat,
                            last_etag_accepted: self.last_sent_etag(),
                            node_tag: self.this_node_tag.clone(),
                            database_change_vector: ChangeVector::new(),
                            exception: None,
                        };
                        if let Err(e) = writer.write_json(&heartbeat).await {
                            return Err(self.fail(transport_err(&self.destination_name, e)));
                        }
                    }
                    _ = self.cancel.cancelled() => {
                        self.set_state(OutboundState::Closed);
                        return Ok(());
                    }
                }
                continue;
            }

            self.set_state(OutboundState::Streaming);
            for chunk in entries.chunks(MAX_BATCH_ITEMS) {
                let mut items = Vec::with_capacity(chunk.len());
                for entry in chunk {
                    let payload = store.read_payload(&entry.payload_ref).map_err(|e| ReplError::Fatal {
                        database: self.this_database_id.clone(),
                        message: e.to_string(),
                    })?;
                    items.push(WireChangeLogEntry {
                        kind: entry.kind,
                        bucket: entry.bucket,
                        etag: entry.etag,
                        id: entry.id.clone(),
                        change_vector: entry.change_vector.clone(),
                        payload,
                    });
                }
                let last_etag_in_batch = chunk.last().unwrap().etag;
                let batch = BatchMessage { items, last_etag_in_batch };
                writer
                    .write_json(&batch)
                    .await
                    .map_err(|e| self.fail(transport_err(&self.destination_name, e)))?;

                let ack: ReplicationMessageReply = reader
                    .read_json()
                    .await
                    .map_err(|e| self.fail(transport_err(&self.destination_name, e)))?;
                validate_reply(&self.destination_name, &ack).map_err(|e| self.fail(e))?;
                self.last_send_etag.store(ack.last_etag_accepted.max(last_etag_in_batch), Ordering::SeqCst);
            }
        }
    }

    fn fail(&self, e: ReplError) -> ReplError {
        self.shutdown.lock().unwrap().on_error(e.to_string());
        self.set_state(OutboundState::Reconnecting);
        e
    }
}

fn transport_err(destination: &str, source: submerge_net::TransportError) -> ReplError {
    ReplError::Transport {
        destination: destination.to_string(),
        source,
    }
}

fn validate_reply(peer: &str, reply: &ReplicationMessageReply) -> Result<(), ReplError> {
    if reply.reply_type == ReplyType::Error {
        return Err(ReplError::Protocol {
            peer: peer.to_string(),
            message: reply.exception.clone().unwrap_or_else(|| "unspecified error".to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use submerge_store::{ChangeLogIndex, MemoryDocumentStore};

    #[test]
    fn apply_tunables_resets_timer_only_on_delay_change() {
        let worker = OutboundWorker::new(
            "peer-A".into(),
            DatabaseId::from("db-a"),
            NodeTag::from("A"),
            DatabaseId::from("db-a"),
            Duration::from_secs(60),
        );
        let before = *worker.next_replicate_at.lock().unwrap();
        worker.apply_tunables(Duration::ZERO, None);
        assert_eq!(*worker.next_replicate_at.lock().unwrap(), before);
        std::thread::sleep(Duration::from_millis(2));
        worker.apply_tunables(Duration::from_secs(5), None);
        assert!(*worker.next_replicate_at.lock().unwrap() > before);
    }

    #[tokio::test]
    async fn run_cancels_cleanly_with_no_peer_entries() {
        let worker = OutboundWorker::new(
            "peer-A".into(),
            DatabaseId::from("db-b"),
            NodeTag::from("A"),
            DatabaseId::from("db-a"),
            Duration::from_secs(60),
        );
        let store = MemoryDocumentStore::new(DatabaseId::from("db-a"), ChangeLogIndex::in_memory().unwrap());

        let (client, server) = tokio::io::duplex(4096);
        let worker_ref = &worker;
        let run_fut = worker_ref.run(client, &store);

        let peer = tokio::spawn(async move {
            let (mut r, mut w) = submerge_net::split(server);
            let _header: TcpConnectionHeader = r.read_json().await.unwrap();
            let _req: ReplicationLatestEtagRequest = r.read_json().await.unwrap();
            w.write_json(&ReplicationMessageReply {
                reply_type: ReplyType::Ok,
                message_type: MessageType::Heartbeat,
                last_etag_accepted: 0,
                node_tag: NodeTag::from("B"),
                database_change_vector: ChangeVector::new(),
                exception: None,
            })
            .await
            .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), run_fut).await;
        assert!(result.is_ok());
        assert!(result.unwrap().is_ok());
        assert_eq!(worker.state(), OutboundState::Closed);
        peer.await.unwrap();
    }
}
