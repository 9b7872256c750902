use submerge_base::DatabaseId;
use thiserror::Error;

/// §7's taxonomy, specialized to replication with the fields the loader and
/// workers actually have on hand when a failure surfaces. Mirrors
/// `submerge_base::Fault` one-to-one; kept as its own type so replication
/// call sites can attach `destination`/`database` without the base crate
/// growing subsystem-specific fields.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("transport error replicating to {destination}: {source}")]
    Transport {
        destination: String,
        #[source]
        source: submerge_net::TransportError,
    },
    #[error("protocol violation from {peer}: {message}")]
    Protocol { peer: String, message: String },
    #[error("task '{task}' is not owned by this node")]
    NotOwner { task: String },
    #[error("Database '{database}' does not exist.")]
    DatabaseGone { database: DatabaseId },
    #[error("consensus command rejected: {0}")]
    Consensus(String),
    #[error("fatal replication error on {database}: {message}")]
    Fatal { database: DatabaseId, message: String },
}

impl ReplError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReplError::Transport { .. } | ReplError::Protocol { .. } | ReplError::Consensus(_))
    }
}

impl From<ReplError> for submerge_base::Fault {
    fn from(e: ReplError) -> Self {
        match e {
            ReplError::Transport { source, .. } => submerge_base::Fault::Transport(source.to_string()),
            ReplError::Protocol { message, .. } => submerge_base::Fault::Protocol(message),
            ReplError::NotOwner { task } => submerge_base::Fault::NotOwner { task },
            ReplError::DatabaseGone { database } => {
                submerge_base::Fault::DatabaseGone { database: database.to_string() }
            }
            ReplError::Consensus(m) => submerge_base::Fault::Consensus(m),
            ReplError::Fatal { message, .. } => submerge_base::Fault::Fatal(message),
        }
    }
}
