//! `is_my_task` (§4.3): every ongoing task (a replication connection, a
//! subscription worker) is owned by exactly one alive node at a time. The
//! mentor node is preferred when it is still a topology member; otherwise
//! ownership is a deterministic function of `(task_id, epoch)` so that every
//! node computes the same answer without needing to talk to each other.

use crate::record::{DatabaseRecord, Member};
use submerge_base::NodeTag;

fn member_is_alive(record: &DatabaseRecord, node_tag: &NodeTag) -> bool {
    record.topology_members.iter().any(|m| &m.node_tag == node_tag)
}

/// Deterministically picks one member out of `members` for `(task_id,
/// epoch)`. Any node computing this with the same `record` snapshot reaches
/// the same answer, so ownership needs no extra coordination once the
/// topology and epoch have converged.
fn hash_assign<'a>(members: &'a [Member], task_id: &str, epoch: u64) -> Option<&'a Member> {
    if members.is_empty() {
        return None;
    }
    let mut bytes = Vec::with_capacity(task_id.len() + 8);
    bytes.extend_from_slice(task_id.as_bytes());
    bytes.extend_from_slice(&epoch.to_le_bytes());
    let hash = rapidhash::rapidhash(&bytes);
    let index = (hash % members.len() as u64) as usize;
    members.get(index)
}

/// Resolves which node owns `task_id`: the mentor node if it is still alive,
/// otherwise the deterministic hash assignment over the current topology.
pub fn whose_task_is_it(
    record: &DatabaseRecord,
    task_id: &str,
    mentor_node: Option<&NodeTag>,
) -> Option<NodeTag> {
    if let Some(mentor) = mentor_node {
        if member_is_alive(record, mentor) {
            return Some(mentor.clone());
        }
    }
    hash_assign(&record.topology_members, task_id, record.epoch).map(|m| m.node_tag.clone())
}

/// `true` iff `this_node` is the owner of `task_id` under `record`.
pub fn is_my_task(
    record: &DatabaseRecord,
    task_id: &str,
    mentor_node: Option<&NodeTag>,
    this_node: &NodeTag,
) -> bool {
    whose_task_is_it(record, task_id, mentor_node).as_ref() == Some(this_node)
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

    fn record(members: Vec<Member>, epoch: u64) -> DatabaseRecord {
        DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-a")),
            epoch,
            topology_members: members,
            ..Default::default()
        }
    }

    #[test]
    fn mentor_node_wins_when_alive() {
        let r = record(vec![member("A"), member("B")], 0);
        let mentor = NodeTag::from("B");
        assert_eq!(whose_task_is_it(&r, "task-1", Some(&mentor)), Some(NodeTag::from("B")));
    }

    #[test]
    fn dead_mentor_falls_back_to_hash_assignment() {
        let r = record(vec![member("A"), member("C")], 0);
        let mentor = NodeTag::from("B"); // not a member: dead
        let assigned = whose_task_is_it(&r, "task-1", Some(&mentor));
        assert!(assigned == Some(NodeTag::from("A")) || assigned == Some(NodeTag::from("C")));
    }

    #[test]
    fn assignment_is_deterministic_across_repeated_calls() {
        let r = record(vec![member("A"), member("B"), member("C")], 3);
        let first = whose_task_is_it(&r, "task-7", None);
        let second = whose_task_is_it(&r, "task-7", None);
        assert_eq!(first, second);
    }

    #[test]
    fn epoch_change_can_reassign() {
        let members = vec![member("A"), member("B"), member("C"), member("D"), member("E")];
        let r0 = record(members.clone(), 0);
        let r1 = record(members, 1);
        // Not asserting inequality (hash collision is possible) -- only that
        // both resolve to a present member, which is the actual invariant.
        assert!(whose_task_is_it(&r0, "task-9", None).is_some());
        assert!(whose_task_is_it(&r1, "task-9", None).is_some());
    }
}
