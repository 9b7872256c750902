use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use submerge_base::{DatabaseId, NodeTag};
use submerge_store::{BucketMigration, ShardRange};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub node_tag: NodeTag,
    pub url: String,
    pub database_id: DatabaseId,
}

/// One internal destination is one other member of this database's
/// replication topology; external destinations are declared separately
/// because they are not cluster members (§3 `ReplicationDestination`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReplicationDestination {
    Internal {
        node_tag: NodeTag,
        url: String,
    },
    ExternalSink {
        connection_string: String,
        hub_name: String,
        cert: Option<String>,
    },
    ExternalRegular {
        connection_string: String,
    },
}

impl ReplicationDestination {
    /// Two destinations are equal iff their (kind, url, database, optional
    /// task-id) tuple matches (§3). `task_id` is folded into the connection
    /// string/url by callers that need per-task identity, so identity here
    /// is exactly "same variant, same addressing fields".
    pub fn identity_key(&self) -> (u8, &str) {
        match self {
            ReplicationDestination::Internal { url, .. } => (0, url.as_str()),
            ReplicationDestination::ExternalSink {
                connection_string, ..
            } => (1, connection_string.as_str()),
            ReplicationDestination::ExternalRegular { connection_string } => {
                (2, connection_string.as_str())
            }
        }
    }

    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::ZERO
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExternalReplication {
    pub destination: ReplicationDestination,
    pub task_id: String,
    pub mentor_node: Option<NodeTag>,
    pub delay_replication_for: std::time::Duration,
    pub disabled: bool,
}

/// Read-only snapshot of everything the replication and subscription
/// engines need from the cluster-wide database record (§4.3). Produced by
/// the consensus log's `read_raw_database_record`; internally consistent
/// because it is built from one read of the log at a single commit index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub this_database_id: Option<DatabaseId>,
    pub epoch: u64,
    pub topology_members: Vec<Member>,
    pub shard_ranges: Vec<ShardRange>,
    pub bucket_migrations: Vec<BucketMigration>,
    pub external_replications: Vec<ExternalReplication>,
    pub sink_pull_replications: Vec<ExternalReplication>,
    /// task id -> assigned node tag, recorded once `whose_task_is_it`
    /// resolves it, so repeated lookups are stable within an epoch.
    pub task_assignments: HashMap<String, NodeTag>,
    pub deletion_in_progress: HashSet<NodeTag>,
    /// `None` when the database record itself has been deleted cluster-wide
    /// (§4.4 reconciler step 1: "the record is null").
    pub disabled: bool,
    /// Subscription definitions, each a single opaque blob under its
    /// cluster key `subscriptions/<db>/<name>` (§6 persisted state
    /// layout). Kept opaque here -- `submerge_sub::SubscriptionState`
    /// serializes/deserializes its own shape into this map so that this
    /// crate never needs to depend on the subscription engine.
    pub subscriptions: HashMap<String, Vec<u8>>,
}

impl DatabaseRecord {
    pub fn is_null(&self) -> bool {
        self.this_database_id.is_none()
    }
}
