//! Wire protocol for replication and subscription connections (§6).
//!
//! One "frame in, frame out" discipline: a paired request/response idiom is
//! why a `ReplicationLatestEtagRequest` and its `ReplicationMessageReply`
//! are modeled as two frames on one connection rather than a single
//! round-trip call. Framing runs over a real `tokio` `TcpStream` with
//! length-delimited JSON, not in-memory queues.

mod messages;
mod transport;

pub use messages::{
    BatchMessage, MessageType, Operation, ReplicationLatestEtagRequest, ReplicationMessageReply,
    ReplyType, SubscriptionAck, SubscriptionAckOutcome, SubscriptionBatchMessage,
    SubscriptionOpenOutcome, SubscriptionOpenReply, SubscriptionOpenRequest, TcpConnectionHeader,
    WireChangeLogEntry, PROTOCOL_VERSION,
};
pub use transport::{split, FrameReader, FrameWriter, TransportError};
