//! Connection Shutdown Tracker (D, §3 `ConnectionShutdownInfo`): per-
//! destination failure history and exponential backoff -- a bounded error
//! window plus a doubling timeout instead of a fixed one.

use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use submerge_base::DatabaseId;

const MAX_ERROR_WINDOW: usize = 25;
const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct RecordedError {
    pub message: String,
    pub at: Instant,
}

/// One destination's retry state. Not `Clone`: the shutdown tracker is
/// mutated in place by the owning worker, matching §5's "mutate the live
/// worker rather than recycling it" guidance for the reconciler.
#[derive(Debug)]
pub struct ConnectionShutdownInfo {
    last_error_window: VecDeque<RecordedError>,
    retries: u32,
    next_timeout: Duration,
    retry_on: Option<Instant>,
    max_timeout_cap: Duration,
    last_heartbeat_ticks: Option<Instant>,
    pub destination_db_id: Option<DatabaseId>,
}

impl ConnectionShutdownInfo {
    pub fn new(max_timeout_cap: Duration) -> Self {
        ConnectionShutdownInfo {
            last_error_window: VecDeque::with_capacity(MAX_ERROR_WINDOW),
            retries: 0,
            next_timeout: INITIAL_TIMEOUT,
            retry_on: None,
            max_timeout_cap,
            last_heartbeat_ticks: None,
            destination_db_id: None,
        }
    }

    /// Records a failure, doubles `next_timeout` (clamped to the cap), and
    /// schedules the next retry with up to 20% jitter added on top so a
    /// whole set of destinations that failed together don't all retry on
    /// the same tick. The error window is bounded -- the oldest entry is
    /// dropped once it would exceed 25.
    pub fn on_error(&mut self, message: impl Into<String>) {
        if self.last_error_window.len() == MAX_ERROR_WINDOW {
            self.last_error_window.pop_front();
        }
        self.last_error_window.push_back(RecordedError {
            message: message.into(),
            at: Instant::now(),
        });
        self.retries += 1;
        self.next_timeout = (self.next_timeout * 2).min(self.max_timeout_cap);
        let jitter_millis = rand::thread_rng().gen_range(0..=(self.next_timeout.as_millis() as u64 / 5).max(1));
        self.retry_on = Some(Instant::now() + self.next_timeout + Duration::from_millis(jitter_millis));
    }

    /// Returns to the initial 1s timeout and clears the retry schedule, but
    /// keeps the error history -- failures are diagnostic, not undone by a
    /// later success.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.next_timeout = INITIAL_TIMEOUT;
        self.retry_on = None;
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_ticks = Some(Instant::now());
    }

    pub fn is_stale(&self, max_inactive_time: Duration) -> bool {
        match self.last_heartbeat_ticks {
            Some(t) => t.elapsed() > max_inactive_time,
            None => false,
        }
    }

    pub fn is_due_for_retry(&self) -> bool {
        match self.retry_on {
            Some(t) => Instant::now() >= t,
            None => true,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn errors(&self) -> impl Iterator<Item = &RecordedError> {
        self.last_error_window.iter()
    }

    /// Total wall time spanned by the current run of continuous failures,
    /// used by the supervisor's `max_erroneous_period` check.
    pub fn continuous_failure_duration(&self) -> Duration {
        match self.last_error_window.front() {
            Some(first) if self.retries > 0 => first.at.elapsed(),
            _ => Duration::ZERO,
        }
    }
}
