//! Subscription Store (H, §4.8/§6): reads and writes `SubscriptionState`
//! blobs through the `ConsensusLog` contract (§6's "used to publish
//! subscription cursors and topology changes").

use crate::error::SubError;
use crate::state::SubscriptionState;
use std::sync::Arc;
use std::time::Duration;
use submerge_base::{ChangeVector, DatabaseId};
use submerge_cluster::{ClusterCommand, ConsensusLog};

const COMMIT_WAIT: Duration = Duration::from_secs(5);

pub struct SubscriptionStore<L: ConsensusLog> {
    log: Arc<L>,
    database: DatabaseId,
}

impl<L: ConsensusLog> SubscriptionStore<L> {
    pub fn new(log: Arc<L>, database: DatabaseId) -> Self {
        SubscriptionStore { log, database }
    }

    fn key(&self, name: &str) -> String {
        SubscriptionState::cluster_key(&self.database.to_string(), name)
    }

    pub async fn get(&self, name: &str) -> Result<Option<SubscriptionState>, SubError> {
        let record = self.read_record().await?;
        let key = self.key(name);
        match record.subscriptions.get(&key) {
            Some(blob) => rmp_serde::from_slice(blob)
                .map(Some)
                .map_err(|e| self.fatal(name, e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn create(&self, state: &SubscriptionState) -> Result<(), SubError> {
        self.write(state).await
    }

    /// Advances the persisted cursor by merging `ack_cv` into whatever is
    /// currently stored -- an ordinary ack only ever moves forward.
    pub async fn advance_cursor(&self, name: &str, ack_cv: ChangeVector) -> Result<(), SubError> {
        let mut state = self.require(name).await?;
        state.change_vector_cursor.merge(&ack_cv);
        self.write(&state).await
    }

    /// Administrator override (§4.8 change-vector jump rule): replaces the
    /// cursor outright, including jumping ahead past entries that would
    /// otherwise still be pending delivery.
    pub async fn admin_set_cursor(&self, name: &str, cursor: ChangeVector) -> Result<(), SubError> {
        let mut state = self.require(name).await?;
        state.change_vector_cursor = cursor;
        self.write(&state).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), SubError> {
        let key = self.key(name);
        let index = self
            .log
            .append_command(ClusterCommand::RemoveSubscriptionBlob { key })
            .await
            .map_err(|e| self.consensus_err(name, format!("{e:?}")))?;
        self.log
            .wait_for_index_notification(index, COMMIT_WAIT)
            .await
            .map_err(|e| self.consensus_err(name, format!("{e:?}")))
    }

    async fn require(&self, name: &str) -> Result<SubscriptionState, SubError> {
        self.get(name).await?.ok_or_else(|| SubError::SubscriptionDoesNotExist {
            name: name.to_string(),
            node: submerge_base::NodeTag::from(""),
            database: self.database.clone(),
        })
    }

    async fn write(&self, state: &SubscriptionState) -> Result<(), SubError> {
        let key = self.key(&state.name);
        let blob = rmp_serde::to_vec(state).map_err(|e| self.fatal(&state.name, e.to_string()))?;
        let index = self
            .log
            .append_command(ClusterCommand::SetSubscriptionBlob { key, blob })
            .await
            .map_err(|e| self.consensus_err(&state.name, format!("{e:?}")))?;
        self.log
            .wait_for_index_notification(index, COMMIT_WAIT)
            .await
            .map_err(|e| self.consensus_err(&state.name, format!("{e:?}")))
    }

    async fn read_record(&self) -> Result<submerge_cluster::DatabaseRecord, SubError> {
        self.log
            .read_raw_database_record()
            .await
            .map_err(|e| SubError::Fatal { name: String::new(), message: format!("{e:?}") })
    }

    fn fatal(&self, name: &str, message: String) -> SubError {
        SubError::Fatal { name: name.to_string(), message }
    }

    fn consensus_err(&self, name: &str, message: String) -> SubError {
        SubError::Consensus { name: name.to_string(), message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use submerge_cluster::InMemoryConsensusLog;

    fn store() -> SubscriptionStore<InMemoryConsensusLog> {
        SubscriptionStore::new(
            Arc::new(InMemoryConsensusLog::new(Default::default())),
            DatabaseId::from("db-a"),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let s = store();
        let state = SubscriptionState::new("Users", "");
        s.create(&state).await.unwrap();
        let back = s.get("Users").await.unwrap().unwrap();
        assert_eq!(back.name, "Users");
    }

    #[tokio::test]
    async fn advance_cursor_merges_forward() {
        let s = store();
        let mut state = SubscriptionState::new("Users", "");
        state.change_vector_cursor.set(DatabaseId::from("db-a"), 5);
        s.create(&state).await.unwrap();

        let mut ack = ChangeVector::new();
        ack.set(DatabaseId::from("db-a"), 10);
        s.advance_cursor("Users", ack).await.unwrap();

        let back = s.get("Users").await.unwrap().unwrap();
        assert_eq!(back.change_vector_cursor.etag_for(&DatabaseId::from("db-a")), 10);
    }

    #[tokio::test]
    async fn admin_set_cursor_can_jump_ahead() {
        let s = store();
        let mut state = SubscriptionState::new("Users", "");
        state.change_vector_cursor.set(DatabaseId::from("db-a"), 1);
        s.create(&state).await.unwrap();

        let mut jumped = ChangeVector::new();
        jumped.set(DatabaseId::from("db-a"), 11);
        s.admin_set_cursor("Users", jumped).await.unwrap();

        let back = s.get("Users").await.unwrap().unwrap();
        assert_eq!(back.change_vector_cursor.etag_for(&DatabaseId::from("db-a")), 11);
    }

    #[tokio::test]
    async fn get_missing_subscription_returns_none() {
        let s = store();
        assert!(s.get("Nope").await.unwrap().is_none());
    }
}
