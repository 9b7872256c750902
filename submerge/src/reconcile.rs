//! Reconcile loop (§4.4 step 6): periodically re-reads the database record
//! and drives the Replication Loader's reconciler, spawning one task per
//! newly wanted outbound destination. `InMemoryConsensusLog` has no
//! subscribe-to-changes API, so this polls instead of being woken by a
//! commit notification -- the real gap a production consensus log would
//! close (see DESIGN.md).

use crate::NodeContext;
use std::sync::Arc;
use std::time::Duration;
use submerge_cluster::{ClusterStateView, ConsensusLog};
use submerge_repl::OutboundWorker;
use tokio_util::sync::CancellationToken;

const RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

pub async fn reconcile_loop(ctx: Arc<NodeContext>, shutdown: CancellationToken) {
    loop {
        if !ctx.replication_loader.try_latch_reconnect() {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => continue,
                _ = shutdown.cancelled() => return,
            }
        }

        let outcome = match ctx.consensus_log.read_raw_database_record().await {
            Ok(record) => {
                let view = ClusterStateView::new(record, ctx.node_tag.clone());
                Some(ctx.replication_loader.handle_database_record_change(&view))
            }
            Err(e) => {
                tracing::warn!(error = ?e, "failed to read database record for reconciliation");
                None
            }
        };
        ctx.replication_loader.unlatch_reconnect();

        if let Some(outcome) = outcome {
            for worker in outcome.additions {
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_outbound(ctx, worker, shutdown));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Connects to a destination and runs its worker loop, reconnecting with
/// the shutdown tracker's backoff on transport failure, until cancelled.
async fn run_outbound(ctx: Arc<NodeContext>, worker: Arc<OutboundWorker>, shutdown: CancellationToken) {
    let dial_target = worker.destination_name.strip_prefix("internal:").unwrap_or(&worker.destination_name);
    let dial_target = dial_target.strip_prefix("tcp://").unwrap_or(dial_target);

    loop {
        if worker.cancel.is_cancelled() || shutdown.is_cancelled() {
            return;
        }
        if worker.disabled.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = worker.cancel.cancelled() => return,
                _ = shutdown.cancelled() => return,
            }
            continue;
        }
        match tokio::net::TcpStream::connect(dial_target).await {
            Ok(stream) => {
                if let Err(e) = worker.run(stream, ctx.document_store.as_ref()).await {
                    tracing::info!(destination = %worker.destination_name, error = %e, "outbound worker stopped");
                }
            }
            Err(e) => {
                tracing::info!(destination = %worker.destination_name, error = %e, "failed to connect to destination");
            }
        }
        if worker.cancel.is_cancelled() || shutdown.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = worker.cancel.cancelled() => return,
            _ = shutdown.cancelled() => return,
        }
    }
}
