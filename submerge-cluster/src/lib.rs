//! Cluster State View (C): a read-only projection of the cluster-wide
//! database record -- topology, shard ranges, active bucket migrations,
//! external replication declarations, and per-task ownership -- plus the
//! `ConsensusLog` contract the record is read from and written through.
//!
//! Narrowed to the one read shape (`ClusterStateView`) and one write shape
//! (`ConsensusLog`) that replication and subscriptions need, rather than a
//! general transaction planner.

mod consensus;
mod record;
mod task;
mod view;

pub use consensus::{ClusterCommand, ConsensusLog, InMemoryConsensusLog};
pub use record::{DatabaseRecord, ExternalReplication, Member, ReplicationDestination};
pub use task::{is_my_task, whose_task_is_it};
pub use view::ClusterStateView;
