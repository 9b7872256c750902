//! Replication engine: Connection Shutdown Tracker (D), Outbound
//! Replication Worker (E), Inbound Replication Handler (F), and the
//! Replication Loader supervisor (G), all driven over real framed TCP
//! connections.

mod error;
mod inbound;
mod loader;
mod outbound;
mod shutdown_tracker;

pub use error::ReplError;
pub use inbound::InboundHandler;
pub use loader::{RejectedConnection, ReconcileOutcome, ReplicationLoader};
pub use outbound::{OutboundState, OutboundTunables, OutboundWorker, HEARTBEAT_INTERVAL, MAX_BATCH_ITEMS};
pub use shutdown_tracker::{ConnectionShutdownInfo, RecordedError};
