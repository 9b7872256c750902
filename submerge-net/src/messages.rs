//! Wire schema of §6. JSON field names here are part of the contract: any
//! serializer whose output matches these names is interchangeable, but the
//! names themselves must not drift.

use serde::{Deserialize, Serialize};
use submerge_base::{ChangeVector, DatabaseId, MutationKind, NodeTag};

/// The first frame sent on every connection, before either side has
/// committed to a replication or subscription conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpConnectionHeader {
    pub operation: Operation,
    pub protocol_version: u32,
    pub database: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Replication,
    Subscription,
}

/// The current protocol version this node speaks. A peer advertising a
/// different version is a `Fault::Protocol` (§7), not silently downgraded.
pub const PROTOCOL_VERSION: u32 = 1;

/// Sent by the outbound worker (or a pull-replication hub client) right
/// after the connection header, to learn where to resume from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationLatestEtagRequest {
    pub source_node_tag: NodeTag,
    pub source_machine_name: String,
    pub source_database_id: DatabaseId,
    pub source_database_name: String,
    pub source_url: String,
    pub last_sent_etag: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReplyType {
    Ok,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageType {
    Heartbeat,
    Batch,
}

/// The receiving side's response to both the initial etag request and every
/// subsequent batch: it always carries the *current* acceptance state, so a
/// heartbeat and a batch-ack share one shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationMessageReply {
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    pub message_type: MessageType,
    pub last_etag_accepted: u64,
    pub node_tag: NodeTag,
    pub database_change_vector: ChangeVector,
    /// Populated only when `reply_type == Error`; human-readable, embeds the
    /// §7 fault classification so the sender can decide whether to retry.
    pub exception: Option<String>,
}

/// One entry of a `BatchMessage`. Mirrors `ChangeLogEntry` (§3) but carries
/// an inline payload instead of the store's opaque `payload_ref` — the
/// payload bytes are whatever the local document store handed the outbound
/// worker (document JSON, attachment bytes, a counter delta, ...).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireChangeLogEntry {
    pub kind: MutationKind,
    pub bucket: u32,
    pub etag: u64,
    pub id: String,
    pub change_vector: ChangeVector,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchMessage {
    pub items: Vec<WireChangeLogEntry>,
    pub last_etag_in_batch: u64,
}

/// First frame on a `Subscription`-operation connection after the header:
/// names the subscription and the opening strategy the worker asked for.
/// `strategy` is carried as a plain string -- this crate has no dependency
/// on `submerge-sub`'s `SubscriptionStrategy` enum, the same way it carries
/// `kind: MutationKind` for documents but knows nothing about query syntax.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionOpenRequest {
    pub name: String,
    pub worker_id: u64,
    pub strategy: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionOpenOutcome {
    Connected,
    Queued,
    TookOver,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionOpenReply {
    pub outcome: SubscriptionOpenOutcome,
    pub reason: Option<String>,
}

/// One delivered batch. Reuses `WireChangeLogEntry`'s shape so a single
/// payload encoding serves both replication and subscription streaming.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscriptionBatchMessage {
    pub items: Vec<WireChangeLogEntry>,
}

/// Whether the worker's subscriber handler processed a batch successfully.
/// `ignore_subscriber_errors` decides what the server does with `Failed`
/// (§4.8 step 5): advance the cursor past it anyway, or hold it back so the
/// same batch is redelivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionAckOutcome {
    Processed,
    Failed,
}

/// Sent by the worker once it has run a `SubscriptionBatchMessage` through
/// its subscriber handler; the server does not send the next batch until
/// this arrives (§4.8's fetch-filter-batch-ack discipline).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub outcome: SubscriptionAckOutcome,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
