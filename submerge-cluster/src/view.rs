//! `ClusterStateView` (§4.3): the read side of the database record, cached
//! for the lifetime of one consensus-log read and handed to the
//! replication/subscription engines as an immutable snapshot. Nothing here
//! mutates the record directly -- mutation goes through
//! [`crate::ConsensusLog::append_command`] and becomes visible on the next
//! `refresh`.

use crate::record::{BucketMigration, DatabaseRecord, ExternalReplication, Member, ShardRange};
use crate::task::is_my_task;
use std::sync::Arc;
use submerge_base::NodeTag;

#[derive(Clone)]
pub struct ClusterStateView {
    record: Arc<DatabaseRecord>,
    this_node: NodeTag,
}

impl ClusterStateView {
    pub fn new(record: DatabaseRecord, this_node: NodeTag) -> Self {
        ClusterStateView {
            record: Arc::new(record),
            this_node,
        }
    }

    pub fn this_node(&self) -> &NodeTag {
        &self.this_node
    }

    pub fn epoch(&self) -> u64 {
        self.record.epoch
    }

    pub fn is_disabled(&self) -> bool {
        self.record.disabled
    }

    pub fn is_null(&self) -> bool {
        self.record.is_null()
    }

    pub fn members(&self) -> &[Member] {
        &self.record.topology_members
    }

    /// The other cluster members eligible as internal replication
    /// destinations: every topology member except this node and any member
    /// currently marked for removal (§4.4 reconciler step 3).
    pub fn internal_destinations(&self) -> Vec<&Member> {
        self.record
            .topology_members
            .iter()
            .filter(|m| m.node_tag != self.this_node)
            .filter(|m| !self.record.deletion_in_progress.contains(&m.node_tag))
            .collect()
    }

    pub fn external_replications(&self) -> &[ExternalReplication] {
        &self.record.external_replications
    }

    pub fn sink_pull_replications(&self) -> &[ExternalReplication] {
        &self.record.sink_pull_replications
    }

    pub fn shard_ranges(&self) -> &[ShardRange] {
        &self.record.shard_ranges
    }

    pub fn bucket_migrations(&self) -> &[BucketMigration] {
        &self.record.bucket_migrations
    }

    pub fn is_deletion_in_progress(&self, node: &NodeTag) -> bool {
        self.record.deletion_in_progress.contains(node)
    }

    /// `true` iff this node owns `task_id` right now (§4.3's `is_my_task`).
    pub fn is_my_task(&self, task_id: &str, mentor_node: Option<&NodeTag>) -> bool {
        is_my_task(&self.record, task_id, mentor_node, &self.this_node)
    }

    pub fn record(&self) -> &DatabaseRecord {
        &self.record
    }

    pub fn subscription_blob(&self, key: &str) -> Option<&[u8]> {
        self.record.subscriptions.get(key).map(|v| v.as_slice())
    }

    pub fn subscription_keys(&self) -> impl Iterator<Item = &str> {
        self.record.subscriptions.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Member;
    use submerge_base::DatabaseId;

    fn member(tag: &str) -> Member {
        Member {
            node_tag: NodeTag::from(tag),
            url: format!("tcp://{tag}"),
            database_id: DatabaseId::from("db-a"),
        }
    }

    #[test]
    fn internal_destinations_exclude_self_and_deletion_in_progress() {
        let mut record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-a")),
            topology_members: vec![member("A"), member("B"), member("C")],
            ..Default::default()
        };
        record.deletion_in_progress.insert(NodeTag::from("C"));
        let view = ClusterStateView::new(record, NodeTag::from("A"));
        let dests: Vec<_> = view.internal_destinations().into_iter().map(|m| m.node_tag.clone()).collect();
        assert_eq!(dests, vec![NodeTag::from("B")]);
    }

    #[test]
    fn is_my_task_delegates_to_task_module() {
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-a")),
            topology_members: vec![member("A"), member("B")],
            ..Default::default()
        };
        let view = ClusterStateView::new(record, NodeTag::from("B"));
        let mentor = NodeTag::from("B");
        assert!(view.is_my_task("task-1", Some(&mentor)));
    }
}
