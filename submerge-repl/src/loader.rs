//! Replication Loader (G, §4.4) -- the supervisor. The reconciler here
//! plays the same role a reconfiguration round plays in a consensus
//! protocol (compute the new member set, diff against the old, converge)
//! but runs locally against a `ClusterStateView` rather than voting.

use crate::outbound::OutboundWorker;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use submerge_base::{DatabaseId, NodeTag};
use submerge_cluster::ClusterStateView;

const MAX_REJECTIONS_PER_SOURCE: usize = 25;
const MAX_INACTIVE_TIME: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RejectedConnection {
    pub reason: String,
    pub at: Instant,
}

struct IncomingInfo {
    last_heartbeat: Instant,
}

/// Outcome of one reconciliation pass: destinations the caller must spawn a
/// connection task for, and workers whose teardown the caller should run
/// off the critical path (§4.4 step 6 -- never block the reconciler).
pub struct ReconcileOutcome {
    pub additions: Vec<Arc<OutboundWorker>>,
    pub disposals: Vec<Arc<OutboundWorker>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LoaderState {
    Active,
    Passive,
}

pub struct ReplicationLoader {
    this_node: NodeTag,
    this_database_id: DatabaseId,
    max_timeout_cap: Duration,
    state: Mutex<LoaderState>,
    outgoing: DashMap<String, Arc<OutboundWorker>>,
    incoming: DashMap<DatabaseId, IncomingInfo>,
    rejections: DashMap<DatabaseId, VecDeque<RejectedConnection>>,
    reconcile_latch: AtomicBool,
}

impl ReplicationLoader {
    pub fn new(this_node: NodeTag, this_database_id: DatabaseId, max_timeout_cap: Duration) -> Self {
        ReplicationLoader {
            this_node,
            this_database_id,
            max_timeout_cap,
            state: Mutex::new(LoaderState::Active),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            rejections: DashMap::new(),
            reconcile_latch: AtomicBool::new(false),
        }
    }

    /// `initialize` (§4.4): idempotent entry point, equivalent to running
    /// the reconciler once against the starting record.
    pub fn initialize(&self, view: &ClusterStateView) -> ReconcileOutcome {
        self.handle_database_record_change(view)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// The reconciler (§4.4 steps 1-6).
    pub fn handle_database_record_change(&self, view: &ClusterStateView) -> ReconcileOutcome {
        if view.is_disabled() || view.is_null() {
            *self.state.lock().unwrap() = LoaderState::Passive;
            let disposals: Vec<_> = self.outgoing.iter().map(|e| e.value().clone()).collect();
            self.outgoing.clear();
            self.incoming.clear();
            for worker in &disposals {
                worker.cancel.cancel();
            }
            return ReconcileOutcome { additions: vec![], disposals };
        }
        *self.state.lock().unwrap() = LoaderState::Active;

        let mut wanted: Vec<(String, DatabaseId, Duration, Option<NodeTag>, bool)> = Vec::new();
        for member in view.internal_destinations() {
            wanted.push((format!("internal:{}", member.url), member.database_id.clone(), Duration::ZERO, None, false));
        }
        for ext in view
            .external_replications()
            .iter()
            .chain(view.sink_pull_replications())
            .filter(|e| view.is_my_task(&e.task_id, e.mentor_node.as_ref()))
        {
            let (_, key) = ext.destination.identity_key();
            // The real peer database id is unknown until the handshake
            // reply; this placeholder is what the worker reports as its
            // target until then.
            wanted.push((
                key.to_string(),
                DatabaseId::from(key),
                ext.delay_replication_for,
                ext.mentor_node.clone(),
                ext.disabled,
            ));
        }

        let mut additions = Vec::new();
        let mut disposals = Vec::new();

        let wanted_keys: std::collections::HashSet<&str> = wanted.iter().map(|(k, ..)| k.as_str()).collect();
        let current_keys: Vec<String> = self.outgoing.iter().map(|e| e.key().clone()).collect();
        for key in &current_keys {
            if !wanted_keys.contains(key.as_str()) {
                if let Some((_, worker)) = self.outgoing.remove(key) {
                    worker.cancel.cancel();
                    disposals.push(worker);
                }
            }
        }

        for (key, target_db, delay, mentor, disabled) in wanted {
            match self.outgoing.get(&key) {
                Some(existing) => {
                    existing.apply_tunables(delay, mentor);
                    existing.disabled.store(disabled, Ordering::SeqCst);
                }
                None => {
                    let worker = Arc::new(OutboundWorker::new(
                        key.clone(),
                        target_db,
                        self.this_node.clone(),
                        self.this_database_id.clone(),
                        self.max_timeout_cap,
                    ));
                    worker.apply_tunables(delay, mentor);
                    worker.disabled.store(disabled, Ordering::SeqCst);
                    self.outgoing.insert(key, worker.clone());
                    additions.push(worker);
                }
            }
        }

        ReconcileOutcome { additions, disposals }
    }

    /// Connection-admission invariants (§4.4). Returns `Ok(())` to accept,
    /// `Err(reason)` to reject -- the caller is responsible for recording
    /// the rejection and closing the socket.
    pub fn admit_incoming(&self, source_database_id: &DatabaseId) -> Result<(), String> {
        if *self.state.lock().unwrap() == LoaderState::Passive {
            let reason = "node is passive".to_string();
            self.record_rejection(source_database_id, &reason);
            return Err(reason);
        }
        if *source_database_id == self.this_database_id {
            let reason = "self-replication is not permitted".to_string();
            self.record_rejection(source_database_id, &reason);
            return Err(reason);
        }
        let existing_is_live = self
            .incoming
            .get(source_database_id)
            .map(|e| e.last_heartbeat.elapsed() <= MAX_INACTIVE_TIME)
            .unwrap_or(false);
        if existing_is_live {
            let reason = "an active connection from this source already exists".to_string();
            self.record_rejection(source_database_id, &reason);
            return Err(reason);
        }
        self.incoming.insert(
            source_database_id.clone(),
            IncomingInfo { last_heartbeat: Instant::now() },
        );
        Ok(())
    }

    pub fn record_heartbeat(&self, source_database_id: &DatabaseId) {
        if let Some(mut info) = self.incoming.get_mut(source_database_id) {
            info.last_heartbeat = Instant::now();
        }
    }

    pub fn drop_incoming(&self, source_database_id: &DatabaseId) {
        self.incoming.remove(source_database_id);
    }

    fn record_rejection(&self, source_database_id: &DatabaseId, reason: &str) {
        let mut entry = self.rejections.entry(source_database_id.clone()).or_default();
        if entry.len() == MAX_REJECTIONS_PER_SOURCE {
            entry.pop_front();
        }
        entry.push_back(RejectedConnection {
            reason: reason.to_string(),
            at: Instant::now(),
        });
        tracing::info!(source = %source_database_id, %reason, "rejected incoming replication connection");
    }

    pub fn rejections_for(&self, source_database_id: &DatabaseId) -> Vec<RejectedConnection> {
        self.rejections
            .get(source_database_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `get_minimal_etag_for_replication` (§4.7): 0 if any destination is
    /// disabled or has never acked, else the min over outgoing workers'
    /// last-sent etag. A full implementation would further lower this by
    /// the min over external-replication persisted cursors read from the
    /// cluster log; omitted here because the reference `ConsensusLog`
    /// fake has no per-task cursor storage, only the subscription store
    /// does (see `submerge_sub::SubscriptionStore`).
    pub fn get_minimal_etag_for_replication(&self) -> u64 {
        let mut min = u64::MAX;
        for entry in self.outgoing.iter() {
            let worker = entry.value();
            if worker.disabled.load(Ordering::SeqCst) || !worker.has_acked() {
                return 0;
            }
            min = min.min(worker.last_sent_etag());
        }
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Tries to acquire the reconnect-loop's CAS latch; returns `false` if
    /// another invocation is already running, so concurrent wake-ups
    /// coalesce into the in-flight pass (§4.4 reconnect loop).
    pub fn try_latch_reconnect(&self) -> bool {
        self.reconcile_latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlatch_reconnect(&self) {
        self.reconcile_latch.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use submerge_cluster::{DatabaseRecord, ExternalReplication, Member, ReplicationDestination};

    fn member(tag: &str, url: &str) -> Member {
        Member { node_tag: NodeTag::from(tag), url: url.into(), database_id: DatabaseId::from(format!("db-{tag}")) }
    }

    fn loader() -> ReplicationLoader {
        ReplicationLoader::new(NodeTag::from("A"), DatabaseId::from("db-A"), Duration::from_secs(60))
    }

    #[test]
    fn reconcile_adds_destinations_for_other_members() {
        let l = loader();
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-A")),
            topology_members: vec![member("A", "tcp://a"), member("B", "tcp://b")],
            ..Default::default()
        };
        let view = ClusterStateView::new(record, NodeTag::from("A"));
        let outcome = l.initialize(&view);
        assert_eq!(outcome.additions.len(), 1);
        assert_eq!(l.outgoing_count(), 1);
    }

    #[test]
    fn reconcile_removes_destinations_no_longer_wanted() {
        let l = loader();
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-A")),
            topology_members: vec![member("A", "tcp://a"), member("B", "tcp://b")],
            ..Default::default()
        };
        let view = ClusterStateView::new(record.clone(), NodeTag::from("A"));
        l.initialize(&view);

        let mut shrunk = record;
        shrunk.topology_members.retain(|m| m.node_tag != NodeTag::from("B"));
        let view2 = ClusterStateView::new(shrunk, NodeTag::from("A"));
        let outcome = l.handle_database_record_change(&view2);
        assert_eq!(outcome.disposals.len(), 1);
        assert_eq!(l.outgoing_count(), 0);
    }

    #[test]
    fn passive_or_null_record_drops_everything() {
        let l = loader();
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-A")),
            topology_members: vec![member("A", "tcp://a"), member("B", "tcp://b")],
            ..Default::default()
        };
        let view = ClusterStateView::new(record, NodeTag::from("A"));
        l.initialize(&view);
        assert_eq!(l.outgoing_count(), 1);

        let disabled = ClusterStateView::new(DatabaseRecord { disabled: true, ..Default::default() }, NodeTag::from("A"));
        let outcome = l.handle_database_record_change(&disabled);
        assert_eq!(outcome.disposals.len(), 1);
        assert_eq!(l.outgoing_count(), 0);
    }

    #[test]
    fn self_replication_is_rejected() {
        let l = loader();
        assert!(l.admit_incoming(&DatabaseId::from("db-A")).is_err());
    }

    #[test]
    fn second_connection_from_live_source_is_rejected_stale_is_not() {
        let l = loader();
        let src = DatabaseId::from("db-B");
        assert!(l.admit_incoming(&src).is_ok());
        assert!(l.admit_incoming(&src).is_err()); // still live, rejected

        // simulate staleness by direct manipulation via drop+reinsert with an old heartbeat
        l.incoming.insert(src.clone(), IncomingInfo { last_heartbeat: Instant::now() - Duration::from_secs(61) });
        assert!(l.admit_incoming(&src).is_ok()); // stale peer superseded by fresh connection
    }

    #[test]
    fn rejections_are_bounded() {
        let l = loader();
        for _ in 0..40 {
            let _ = l.admit_incoming(&DatabaseId::from("db-A"));
        }
        assert_eq!(l.rejections_for(&DatabaseId::from("db-A")).len(), MAX_REJECTIONS_PER_SOURCE);
    }

    #[test]
    fn disabled_external_destination_is_not_dialed_and_zeroes_minimal_etag() {
        let l = loader();
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-A")),
            external_replications: vec![ExternalReplication {
                destination: ReplicationDestination::ExternalRegular {
                    connection_string: "tcp://elsewhere".to_string(),
                },
                task_id: "task-1".to_string(),
                mentor_node: Some(NodeTag::from("A")),
                delay_replication_for: Duration::ZERO,
                disabled: true,
            }],
            ..Default::default()
        };
        let view = ClusterStateView::new(record, NodeTag::from("A"));
        let outcome = l.initialize(&view);
        assert_eq!(outcome.additions.len(), 1);
        assert!(outcome.additions[0].disabled.load(Ordering::SeqCst));
        assert_eq!(l.get_minimal_etag_for_replication(), 0);
    }

    #[test]
    fn minimal_etag_is_zero_until_every_destination_has_acked() {
        let l = loader();
        assert_eq!(l.get_minimal_etag_for_replication(), 0);
        let record = DatabaseRecord {
            this_database_id: Some(DatabaseId::from("db-A")),
            topology_members: vec![member("A", "tcp://a"), member("B", "tcp://b")],
            ..Default::default()
        };
        let view = ClusterStateView::new(record, NodeTag::from("A"));
        l.initialize(&view);
        assert_eq!(l.get_minimal_etag_for_replication(), 0); // never acked
    }

    #[test]
    fn reconnect_latch_coalesces_concurrent_wakeups() {
        let l = loader();
        assert!(l.try_latch_reconnect());
        assert!(!l.try_latch_reconnect());
        l.unlatch_reconnect();
        assert!(l.try_latch_reconnect());
    }
}
