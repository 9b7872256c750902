use thiserror::Error;

/// The §7 error taxonomy, shared by the replication and subscription
/// subsystems. Every condition in either subsystem maps to exactly one of
/// these variants; subsystem-specific error types (`submerge_repl::ReplError`,
/// `submerge_sub::SubError`) wrap a `Fault` with the extra context (peer
/// address, subscription name, ...) their callers need.
#[derive(Debug, Error, Clone)]
pub enum Fault {
    /// Socket error or unexpected EOF. Recoverable; triggers reconnect with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame, unexpected message type, or version mismatch.
    /// Recoverable once; surfaced if it repeats within a short window.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The destination says "this task is not mine"; the caller should
    /// re-query topology and either re-target or drop itself.
    #[error("not owner of task {task}")]
    NotOwner { task: String },

    /// The peer database has been deleted or does not exist. Fatal for the
    /// specific destination.
    #[error("Database '{database}' does not exist.")]
    DatabaseGone { database: String },

    /// The user-supplied subscription handler threw.
    #[error("subscriber handler error: {0}")]
    SubscriberHandler(String),

    /// A command was rejected by the cluster log. Retry with jitter; if
    /// persistent, surface.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Inconsistent change vector, corrupted frame, or a broken invariant.
    /// Shuts the database down.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Fault {
    /// Whether the fault is locally recoverable by retrying, as opposed to
    /// requiring the caller to unwind (§7 propagation policy).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Fault::Transport(_) | Fault::Protocol(_) | Fault::Consensus(_) | Fault::NotOwner { .. }
        )
    }
}
