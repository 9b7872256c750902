use submerge_base::{DatabaseId, NodeTag};
use thiserror::Error;

/// §7's taxonomy specialized to subscriptions, carrying the subscription
/// name / node tag / database name every user-visible failure must embed.
#[derive(Debug, Error, Clone)]
pub enum SubError {
    #[error("Database '{database}' does not exist.")]
    DatabaseDoesNotExist { database: DatabaseId },

    #[error("Stopping subscription '{name}' on node {node}, because database '{database}' is being deleted.")]
    SubscriptionDoesNotExist {
        name: String,
        node: NodeTag,
        database: DatabaseId,
    },

    #[error("subscriber handler error on '{name}': {message}")]
    SubscriberHandler { name: String, message: String },

    #[error("transport error serving subscription '{name}': {message}")]
    Transport { name: String, message: String },

    #[error("consensus command rejected for '{name}': {message}")]
    Consensus { name: String, message: String },

    #[error("subscription '{name}' dropped: {reason}")]
    Dropped { name: String, reason: String },

    #[error("fatal subscription error on '{name}': {message}")]
    Fatal { name: String, message: String },
}

impl From<SubError> for submerge_base::Fault {
    fn from(e: SubError) -> Self {
        match e {
            SubError::DatabaseDoesNotExist { database } => {
                submerge_base::Fault::DatabaseGone { database: database.to_string() }
            }
            SubError::SubscriptionDoesNotExist { database, .. } => {
                submerge_base::Fault::DatabaseGone { database: database.to_string() }
            }
            SubError::SubscriberHandler { message, .. } => submerge_base::Fault::SubscriberHandler(message),
            SubError::Transport { message, .. } => submerge_base::Fault::Transport(message),
            SubError::Consensus { message, .. } => submerge_base::Fault::Consensus(message),
            SubError::Dropped { reason, .. } => submerge_base::Fault::Fatal(reason),
            SubError::Fatal { message, .. } => submerge_base::Fault::Fatal(message),
        }
    }
}
