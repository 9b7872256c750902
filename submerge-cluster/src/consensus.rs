//! The consensus log is an external collaborator (§6): this crate only
//! needs `read_raw_database_record`, `append_command`, and
//! `wait_for_index_notification` out of it. `InMemoryConsensusLog` is a
//! reference implementation — a single-node fake with no actual Raft —
//! sufficient to drive `submerge-repl`/`submerge-sub` in tests without a
//! real cluster.

use crate::record::DatabaseRecord;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use submerge_base::{err, Result};
use tokio::sync::Notify;

#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// A consistent read of the current database record, at whatever index
    /// the log has most recently applied locally.
    async fn read_raw_database_record(&self) -> Result<DatabaseRecord>;

    /// Appends a command to the log and returns the index it was committed
    /// at. The caller does not get to assume the command has been *applied*
    /// yet — only `wait_for_index_notification` confirms that.
    async fn append_command(&self, command: ClusterCommand) -> Result<u64>;

    /// Blocks until the local copy of the database record has applied at
    /// least `index`, or `timeout` elapses.
    async fn wait_for_index_notification(&self, index: u64, timeout: Duration) -> Result<()>;
}

/// Mutations the replication/subscription engines ask the cluster to make
/// durable. Kept as an explicit enum (rather than a raw blob) because the
/// fake log below needs to interpret them to keep its record up to date;
/// a real consensus log would serialize these as its own command type.
#[derive(Clone, Debug)]
pub enum ClusterCommand {
    RecordTaskAssignment { task_id: String, node_tag: submerge_base::NodeTag },
    AdvanceEpoch,
    SetDisabled(bool),
    /// Writes one subscription's serialized blob under its cluster key
    /// (§6: "each subscription is a single blob stored under a cluster
    /// key `subscriptions/<db>/<name>`").
    SetSubscriptionBlob { key: String, blob: Vec<u8> },
    RemoveSubscriptionBlob { key: String },
}

struct State {
    record: DatabaseRecord,
    applied_index: u64,
}

pub struct InMemoryConsensusLog {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryConsensusLog {
    pub fn new(initial: DatabaseRecord) -> Self {
        InMemoryConsensusLog {
            state: Mutex::new(State {
                record: initial,
                applied_index: 0,
            }),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl ConsensusLog for InMemoryConsensusLog {
    async fn read_raw_database_record(&self) -> Result<DatabaseRecord> {
        Ok(self.state.lock().unwrap().record.clone())
    }

    async fn append_command(&self, command: ClusterCommand) -> Result<u64> {
        let index = {
            let mut state = self.state.lock().unwrap();
            match command {
                ClusterCommand::RecordTaskAssignment { task_id, node_tag } => {
                    state.record.task_assignments.insert(task_id, node_tag);
                }
                ClusterCommand::AdvanceEpoch => {
                    state.record.epoch += 1;
                    state.record.task_assignments.clear();
                }
                ClusterCommand::SetDisabled(disabled) => {
                    state.record.disabled = disabled;
                }
                ClusterCommand::SetSubscriptionBlob { key, blob } => {
                    state.record.subscriptions.insert(key, blob);
                }
                ClusterCommand::RemoveSubscriptionBlob { key } => {
                    state.record.subscriptions.remove(&key);
                }
            }
            state.applied_index += 1;
            state.applied_index
        };
        self.notify.notify_waiters();
        Ok(index)
    }

    async fn wait_for_index_notification(&self, index: u64, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().unwrap().applied_index >= index {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(err(format!(
                    "timed out waiting for consensus index {index}"
                )));
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}
