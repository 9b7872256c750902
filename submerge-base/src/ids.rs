use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one database replica (one node's copy of one database) cluster-wide.
///
/// Used as the left-hand side of a [`crate::ChangeVector`] entry and as the key
/// of the replication loader's `incoming`/`outgoing` maps.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub String);

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(s: &str) -> Self {
        DatabaseId(s.to_string())
    }
}

/// A human-assigned, stable name for a cluster member (distinct from its
/// database id, which changes if the database is re-created on the node).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeTag(pub String);

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(s: &str) -> Self {
        NodeTag(s.to_string())
    }
}
