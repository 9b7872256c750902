//! `SubscriptionState` (§3): the consensus-replicated definition of one
//! subscription -- a plain `Serialize`/`Deserialize` struct carried through
//! the cluster log.

use serde::{Deserialize, Serialize};
use submerge_base::{ChangeVector, NodeTag};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SubscriptionStrategy {
    OpenIfFree,
    WaitForFree,
    TakeOver,
    Concurrent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub max_docs_per_batch: usize,
    pub ignore_subscriber_errors: bool,
    pub strategy: SubscriptionStrategy,
    pub time_to_wait_before_connection_retry: Duration,
    pub max_erroneous_period: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            max_docs_per_batch: 128,
            ignore_subscriber_errors: false,
            strategy: SubscriptionStrategy::OpenIfFree,
            time_to_wait_before_connection_retry: Duration::from_secs(5),
            max_erroneous_period: Duration::from_secs(300),
        }
    }
}

/// Replicated via consensus, one blob per `cluster_key` (§6). `cursor` is
/// the exclusive lower bound of the next batch: the local store etag
/// threshold below which every entry has already been delivered and acked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub id: String,
    pub name: String,
    pub query: String,
    pub change_vector_cursor: ChangeVector,
    pub mentor_node: Option<NodeTag>,
    pub disabled: bool,
}

impl SubscriptionState {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        let name = name.into();
        SubscriptionState {
            id: name.clone(),
            name,
            query: query.into(),
            change_vector_cursor: ChangeVector::new(),
            mentor_node: None,
            disabled: false,
        }
    }

    pub fn cluster_key(database: &str, name: &str) -> String {
        format!("subscriptions/{database}/{name}")
    }
}

/// The filter predicate over a document's projection (§4.8 step 3). This
/// engine has no query parser (an explicit non-goal); an empty query
/// matches everything, a non-empty one is a literal substring match over
/// the payload bytes, which is sufficient to express the seed scenarios'
/// per-field filters without a
/// query language.
pub fn matches_query(query: &str, payload: &[u8]) -> bool {
    if query.is_empty() {
        return true;
    }
    let haystack = String::from_utf8_lossy(payload);
    haystack.contains(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        assert!(matches_query("", b"{\"Name\":\"oren\"}"));
    }

    #[test]
    fn non_empty_query_is_substring_match() {
        assert!(matches_query("\"Age\":40", b"{\"Name\":\"x\",\"Age\":40}"));
        assert!(!matches_query("\"Age\":40", b"{\"Name\":\"x\",\"Age\":20}"));
    }
}
