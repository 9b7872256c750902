//! Subscription Supervisor (J, §4.9). One process-wide registry enforcing
//! the strategy each subscription was opened with: `OpenIfFree` admits the
//! first comer and rejects everyone else, `WaitForFree` parks everyone but
//! the incumbent in a FIFO queue and promotes the head on disconnect,
//! `TakeOver` always admits the newcomer and evicts whoever held the slot,
//! and `Concurrent` has no slot at all -- every worker that asks is
//! admitted.

use crate::error::SubError;
use crate::state::SubscriptionStrategy;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistrationOutcome {
    Connected,
    /// `WaitForFree` only: parked behind the incumbent, promoted later.
    Queued,
    TookOver,
}

#[derive(Clone, Debug)]
struct ActiveSlot {
    worker_id: u64,
}

struct FailureInfo {
    count: usize,
    last_connection_failure: Instant,
}

pub struct SubscriptionSupervisor {
    active: DashMap<String, ActiveSlot>,
    wait_queue: DashMap<String, VecDeque<u64>>,
    concurrent: DashMap<String, HashSet<u64>>,
    failures: DashMap<String, FailureInfo>,
    promotions: DashMap<String, Arc<Notify>>,
}

impl SubscriptionSupervisor {
    pub fn new() -> Self {
        SubscriptionSupervisor {
            active: DashMap::new(),
            wait_queue: DashMap::new(),
            concurrent: DashMap::new(),
            failures: DashMap::new(),
            promotions: DashMap::new(),
        }
    }

    fn notify_for(&self, name: &str) -> Arc<Notify> {
        self.promotions.entry(name.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    /// Blocks a queued `WaitForFree` worker until it becomes active or
    /// `cancel` fires. Returns `true` once promoted, `false` on cancel.
    /// Handlers call this right after `register_subscription_connection`
    /// returns `RegistrationOutcome::Queued`.
    pub async fn wait_for_turn(&self, name: &str, worker_id: u64, cancel: &tokio_util::sync::CancellationToken) -> bool {
        let notify = self.notify_for(name);
        loop {
            if self.active_worker(name) == Some(worker_id) {
                return true;
            }
            tokio::select! {
                _ = notify.notified() => continue,
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Admits, queues, or rejects `worker_id` under `strategy` (§4.9).
    /// Re-registering the same `worker_id` that already holds the slot is
    /// always a no-op success, regardless of strategy -- a worker retrying
    /// its own heartbeat registration must never be told it lost to itself.
    pub fn register_subscription_connection(
        &self,
        name: &str,
        worker_id: u64,
        strategy: SubscriptionStrategy,
    ) -> Result<RegistrationOutcome, SubError> {
        match strategy {
            SubscriptionStrategy::Concurrent => {
                self.concurrent.entry(name.to_string()).or_default().insert(worker_id);
                Ok(RegistrationOutcome::Connected)
            }
            SubscriptionStrategy::OpenIfFree => {
                if self.held_by_other(name, worker_id) {
                    return Err(SubError::Dropped {
                        name: name.to_string(),
                        reason: "a subscriber is already connected".to_string(),
                    });
                }
                self.active.insert(name.to_string(), ActiveSlot { worker_id });
                self.reset_failures(name);
                Ok(RegistrationOutcome::Connected)
            }
            SubscriptionStrategy::WaitForFree => {
                // Not atomic across the two DashMap accesses below -- two
                // concurrent first-comers could both observe "free" and
                // both become active; acceptable at this engine's reference
                // scale, same simplification as `ReplicationLoader::admit_incoming`.
                if self.active.get(name).map(|s| s.worker_id == worker_id).unwrap_or(false) {
                    return Ok(RegistrationOutcome::Connected);
                }
                if self.active.get(name).is_none() {
                    self.active.insert(name.to_string(), ActiveSlot { worker_id });
                    self.reset_failures(name);
                    Ok(RegistrationOutcome::Connected)
                } else {
                    let mut queue = self.wait_queue.entry(name.to_string()).or_default();
                    if !queue.contains(&worker_id) {
                        queue.push_back(worker_id);
                    }
                    Ok(RegistrationOutcome::Queued)
                }
            }
            SubscriptionStrategy::TakeOver => {
                let took_over = self.held_by_other(name, worker_id);
                self.active.insert(name.to_string(), ActiveSlot { worker_id });
                self.reset_failures(name);
                if took_over {
                    warn!(subscription = name, worker = worker_id, "subscription connection took over");
                    Ok(RegistrationOutcome::TookOver)
                } else {
                    Ok(RegistrationOutcome::Connected)
                }
            }
        }
    }

    fn held_by_other(&self, name: &str, worker_id: u64) -> bool {
        self.active
            .get(name)
            .map(|slot| slot.worker_id != worker_id)
            .unwrap_or(false)
    }

    /// Releases `worker_id`'s slot (or dequeues it, or drops its seat among
    /// `Concurrent` workers) and records a failure -- resetting the
    /// `last_connection_failure` stopwatch that `erroneous_period_elapsed`
    /// reads. When `worker_id` held the active slot under `WaitForFree`,
    /// the head of the wait queue is promoted; the promoted worker id (if
    /// any) is returned so the caller can wake it. A worker that was never
    /// actually holding the slot (e.g. it lost a `TakeOver` race) is a
    /// harmless no-op here.
    pub fn drop_subscription_connection(&self, name: &str, worker_id: u64, reason: impl Into<String>) -> Option<u64> {
        let reason = reason.into();
        let was_active = self
            .active
            .get(name)
            .map(|slot| slot.worker_id == worker_id)
            .unwrap_or(false);
        if was_active {
            self.active.remove(name);
        } else if let Some(mut queue) = self.wait_queue.get_mut(name) {
            queue.retain(|w| *w != worker_id);
        }
        if let Some(mut workers) = self.concurrent.get_mut(name) {
            workers.remove(&worker_id);
        }

        let mut failure = self.failures.entry(name.to_string()).or_insert_with(|| FailureInfo {
            count: 0,
            last_connection_failure: Instant::now(),
        });
        failure.count += 1;
        failure.last_connection_failure = Instant::now();
        drop(failure);

        warn!(subscription = name, worker = worker_id, reason = reason.as_str(), "subscription connection dropped");

        if !was_active {
            return None;
        }
        let promoted = self.wait_queue.get_mut(name).and_then(|mut q| q.pop_front());
        if let Some(next_worker) = promoted {
            self.active.insert(name.to_string(), ActiveSlot { worker_id: next_worker });
            self.notify_for(name).notify_waiters();
        }
        promoted
    }

    fn reset_failures(&self, name: &str) {
        self.failures.remove(name);
    }

    pub fn active_worker(&self, name: &str) -> Option<u64> {
        self.active.get(name).map(|s| s.worker_id)
    }

    pub fn queued_workers(&self, name: &str) -> Vec<u64> {
        self.wait_queue.get(name).map(|q| q.iter().copied().collect()).unwrap_or_default()
    }

    pub fn concurrent_workers(&self, name: &str) -> Vec<u64> {
        self.concurrent.get(name).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn failure_count(&self, name: &str) -> usize {
        self.failures.get(name).map(|f| f.count).unwrap_or(0)
    }

    /// True once `max_erroneous_period` has elapsed since the last recorded
    /// failure with no successful reconnect in between (§4.9's
    /// `max_erroneous_period` disables a subscription outright).
    pub fn erroneous_period_elapsed(&self, name: &str, max_erroneous_period: Duration) -> bool {
        self.failures
            .get(name)
            .map(|f| f.last_connection_failure.elapsed() >= max_erroneous_period)
            .unwrap_or(false)
    }
}

impl Default for SubscriptionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_if_free_rejects_a_second_worker() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::OpenIfFree).unwrap();
        let err = sup.register_subscription_connection("Users", 2, SubscriptionStrategy::OpenIfFree).unwrap_err();
        assert!(matches!(err, SubError::Dropped { .. }));
        assert_eq!(sup.active_worker("Users"), Some(1));
    }

    #[test]
    fn take_over_evicts_the_incumbent() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::OpenIfFree).unwrap();
        let outcome = sup.register_subscription_connection("Users", 2, SubscriptionStrategy::TakeOver).unwrap();
        assert_eq!(outcome, RegistrationOutcome::TookOver);
        assert_eq!(sup.active_worker("Users"), Some(2));
    }

    #[test]
    fn concurrent_admits_every_worker() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::Concurrent).unwrap();
        sup.register_subscription_connection("Users", 2, SubscriptionStrategy::Concurrent).unwrap();
        let mut workers = sup.concurrent_workers("Users");
        workers.sort();
        assert_eq!(workers, vec![1, 2]);
    }

    #[test]
    fn drop_then_reregister_under_open_if_free_succeeds() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::OpenIfFree).unwrap();
        sup.drop_subscription_connection("Users", 1, "handler disconnected");
        assert_eq!(sup.failure_count("Users"), 1);
        sup.register_subscription_connection("Users", 2, SubscriptionStrategy::OpenIfFree).unwrap();
        assert_eq!(sup.active_worker("Users"), Some(2));
        assert_eq!(sup.failure_count("Users"), 0);
    }

    #[test]
    fn re_registering_the_incumbent_is_a_no_op_success() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        let outcome = sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Connected);
    }

    /// §8 scenario 4: W1 opens and becomes active, W2 opens and queues;
    /// dropping W1 promotes W2 to active without either caller ever seeing
    /// a hang.
    #[test]
    fn wait_for_free_promotes_the_queued_worker_on_drop() {
        let sup = SubscriptionSupervisor::new();
        let w1 = sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        assert_eq!(w1, RegistrationOutcome::Connected);
        let w2 = sup.register_subscription_connection("Users", 2, SubscriptionStrategy::WaitForFree).unwrap();
        assert_eq!(w2, RegistrationOutcome::Queued);
        assert_eq!(sup.queued_workers("Users"), vec![2]);

        let promoted = sup.drop_subscription_connection("Users", 1, "disconnected");
        assert_eq!(promoted, Some(2));
        assert_eq!(sup.active_worker("Users"), Some(2));
        assert!(sup.queued_workers("Users").is_empty());
    }

    #[test]
    fn dropping_a_queued_worker_does_not_disturb_the_incumbent() {
        let sup = SubscriptionSupervisor::new();
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        sup.register_subscription_connection("Users", 2, SubscriptionStrategy::WaitForFree).unwrap();
        let promoted = sup.drop_subscription_connection("Users", 2, "gave up waiting");
        assert_eq!(promoted, None);
        assert_eq!(sup.active_worker("Users"), Some(1));
    }

    /// §8 scenario 4 end-to-end: a queued worker's `wait_for_turn` future
    /// only resolves once the incumbent is dropped, never hanging forever.
    #[tokio::test]
    async fn wait_for_turn_resolves_once_promoted() {
        let sup = Arc::new(SubscriptionSupervisor::new());
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        sup.register_subscription_connection("Users", 2, SubscriptionStrategy::WaitForFree).unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let waiter_sup = sup.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move { waiter_sup.wait_for_turn("Users", 2, &waiter_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.drop_subscription_connection("Users", 1, "disconnected");

        let promoted = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(promoted);
        assert_eq!(sup.active_worker("Users"), Some(2));
    }

    #[tokio::test]
    async fn wait_for_turn_returns_false_on_cancel() {
        let sup = Arc::new(SubscriptionSupervisor::new());
        sup.register_subscription_connection("Users", 1, SubscriptionStrategy::WaitForFree).unwrap();
        sup.register_subscription_connection("Users", 2, SubscriptionStrategy::WaitForFree).unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let resolved = sup.wait_for_turn("Users", 2, &cancel).await;
        assert!(!resolved);
    }
}
