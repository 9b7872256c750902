//! Subscription Connection (I, §4.8). One instance per active subscriber,
//! driven by the supervisor (J). Grounded in `submerge-repl`'s outbound
//! worker's "read from the change log / filter / deliver / await ack"
//! discipline, adapted to apply a query predicate and an ack-driven cursor
//! instead of a peer-reported etag.

use crate::error::SubError;
use crate::state::{matches_query, SubscriptionOptions, SubscriptionState};
use crate::store::SubscriptionStore;
use std::sync::Arc;
use submerge_base::{ChangeVector, DatabaseId, MutationKind, NodeTag};
use submerge_cluster::ConsensusLog;
use submerge_store::DocumentStore;

#[derive(Clone, Debug)]
pub struct SubscriptionItem {
    pub id: String,
    pub etag: u64,
    pub payload: Vec<u8>,
    pub change_vector: ChangeVector,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionBatch {
    pub items: Vec<SubscriptionItem>,
}

impl SubscriptionBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The change vector to ack once every item in this batch has been
    /// delivered to (and acknowledged by) the subscriber -- this node's own
    /// entry advances to the batch's highest etag.
    pub fn batch_change_vector(&self, database: &DatabaseId) -> ChangeVector {
        let mut cv = ChangeVector::new();
        if let Some(last) = self.items.last() {
            cv.set(database.clone(), last.etag);
        }
        cv
    }
}

pub struct SubscriptionConnection<L: ConsensusLog, D: DocumentStore> {
    store: Arc<SubscriptionStore<L>>,
    document_store: Arc<D>,
    database: DatabaseId,
    name: String,
    max_docs_per_batch: usize,
    ignore_subscriber_errors: bool,
}

impl<L: ConsensusLog, D: DocumentStore> SubscriptionConnection<L, D> {
    pub fn new(
        store: Arc<SubscriptionStore<L>>,
        document_store: Arc<D>,
        database: DatabaseId,
        name: impl Into<String>,
    ) -> Self {
        SubscriptionConnection {
            store,
            document_store,
            database,
            name: name.into(),
            max_docs_per_batch: 128,
            ignore_subscriber_errors: false,
        }
    }

    pub fn with_options(mut self, options: &SubscriptionOptions) -> Self {
        self.max_docs_per_batch = options.max_docs_per_batch;
        self.ignore_subscriber_errors = options.ignore_subscriber_errors;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// §4.8 step 5: whether a failing subscriber handler still advances the
    /// cursor past the batch it failed on, instead of leaving it to be
    /// redelivered.
    pub fn ignore_subscriber_errors(&self) -> bool {
        self.ignore_subscriber_errors
    }

    /// Pulls the next batch, if any (§4.8 steps 1-4): resolve the cursor,
    /// scan the change log in ascending etag order from the cursor, apply
    /// the query predicate, and stop at `max_docs_per_batch`. `Ok(None)`
    /// means there is nothing new to deliver -- the caller should idle /
    /// wait for a heartbeat rather than treat this as an error.
    pub async fn next_batch(&self) -> Result<Option<SubscriptionBatch>, SubError> {
        let state = self.load_state().await?;
        if state.disabled {
            return Ok(None);
        }
        let from_etag = state.change_vector_cursor.etag_for(&self.database);
        let entries = self
            .document_store
            .index()
            .scan_all(MutationKind::Document, from_etag)
            .map_err(|e| self.fatal(format!("{e}")))?;

        let mut items = Vec::new();
        for entry in entries {
            if items.len() >= self.max_docs_per_batch {
                break;
            }
            let payload = self
                .document_store
                .read_payload(&entry.payload_ref)
                .map_err(|e| self.fatal(format!("{e}")))?;
            if !matches_query(&state.query, &payload) {
                continue;
            }
            items.push(SubscriptionItem {
                id: entry.id,
                etag: entry.etag,
                payload,
                change_vector: entry.change_vector,
            });
        }

        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SubscriptionBatch { items }))
        }
    }

    /// Acknowledges a delivered batch (§4.8 step 5): advances the
    /// persisted cursor to the batch's highest etag. Whether this is called
    /// after a failing subscriber handler is the caller's decision, guided
    /// by `ignore_subscriber_errors` above.
    pub async fn ack(&self, batch: &SubscriptionBatch) -> Result<(), SubError> {
        let cv = batch.batch_change_vector(&self.database);
        if cv.is_empty() {
            return Ok(());
        }
        self.store.advance_cursor(&self.name, cv).await
    }

    /// The §4.8 change-vector jump rule: true once the persisted cursor
    /// already covers `batch`'s highest etag *before* this connection has
    /// acked it. Since only this connection's own `ack` ordinarily moves
    /// the cursor, the only way that can happen while the batch is still
    /// in flight is an administrator's cursor jump (or, under the
    /// `Concurrent` strategy, a sibling connection) -- either way this
    /// batch must not be redelivered or acked again.
    pub async fn cursor_was_jumped_past(&self, batch: &SubscriptionBatch) -> Result<bool, SubError> {
        let state = self.load_state().await?;
        let batch_cv = batch.batch_change_vector(&self.database);
        Ok(!batch_cv.is_empty() && state.change_vector_cursor.dominates(&batch_cv))
    }

    async fn load_state(&self) -> Result<SubscriptionState, SubError> {
        self.store
            .get(&self.name)
            .await?
            .ok_or_else(|| SubError::SubscriptionDoesNotExist {
                name: self.name.clone(),
                node: NodeTag::from(""),
                database: self.database.clone(),
            })
    }

    fn fatal(&self, message: String) -> SubError {
        SubError::Fatal { name: self.name.clone(), message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use submerge_cluster::InMemoryConsensusLog;
    use submerge_store::{ChangeLogIndex, MemoryDocumentStore};

    fn database() -> DatabaseId {
        DatabaseId::from("db-a")
    }

    fn harness() -> (
        Arc<SubscriptionStore<InMemoryConsensusLog>>,
        Arc<MemoryDocumentStore>,
    ) {
        let log = Arc::new(InMemoryConsensusLog::new(Default::default()));
        let store = Arc::new(SubscriptionStore::new(log, database()));
        let docs = Arc::new(MemoryDocumentStore::new(database(), ChangeLogIndex::in_memory().unwrap()));
        (store, docs)
    }

    #[tokio::test]
    async fn delivers_all_docs_matching_query_and_acks_advance_cursor() {
        let (store, docs) = harness();
        let state = SubscriptionState::new("Users", "\"active\":true");
        store.create(&state).await.unwrap();

        docs.put(MutationKind::Document, "users/1", br#"{"active":true}"#.to_vec(), None).unwrap();
        docs.put(MutationKind::Document, "users/2", br#"{"active":false}"#.to_vec(), None).unwrap();
        docs.put(MutationKind::Document, "users/3", br#"{"active":true}"#.to_vec(), None).unwrap();

        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users");
        let batch = conn.next_batch().await.unwrap().expect("non-empty batch");
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[0].id, "users/1");
        assert_eq!(batch.items[1].id, "users/3");

        conn.ack(&batch).await.unwrap();
        assert!(conn.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn max_docs_per_batch_caps_a_single_pull() {
        let (store, docs) = harness();
        let state = SubscriptionState::new("Users", "");
        let mut options = SubscriptionOptions::default();
        options.max_docs_per_batch = 2;
        store.create(&state).await.unwrap();

        for i in 0..5 {
            docs.put(MutationKind::Document, &format!("users/{i}"), b"{}".to_vec(), None).unwrap();
        }

        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users")
            .with_options(&options);
        let batch = conn.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.items.len(), 2);
    }

    #[tokio::test]
    async fn admin_jump_is_observed_by_in_flight_connections() {
        let (store, docs) = harness();
        let state = SubscriptionState::new("Users", "");
        store.create(&state).await.unwrap();

        let first = docs.put(MutationKind::Document, "users/1", b"{}".to_vec(), None).unwrap();
        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users");
        let first_batch = conn.next_batch().await.unwrap().unwrap();
        conn.ack(&first_batch).await.unwrap();
        let _ = first;

        let second = docs.put(MutationKind::Document, "users/2", b"{}".to_vec(), None).unwrap();
        let in_flight = conn.next_batch().await.unwrap().unwrap();
        assert!(!conn.cursor_was_jumped_past(&in_flight).await.unwrap());

        let mut jumped = ChangeVector::new();
        jumped.set(database(), second.etag);
        store.admin_set_cursor("Users", jumped).await.unwrap();

        assert!(conn.cursor_was_jumped_past(&in_flight).await.unwrap());
        assert!(conn.next_batch().await.unwrap().is_none());
    }

    /// The "failing handler still advances the cursor" scenario, at the
    /// level this crate actually controls: `ignore_subscriber_errors` is a
    /// wire-level option read by the caller's handler loop, not enforced
    /// here (this connection has no handler concept at all, only
    /// pull/ack), so the mechanical half of the scenario is that acking
    /// one doc at a time with `max_docs_per_batch == 1` still walks the
    /// whole backlog to the last document's change vector regardless of
    /// what the remote handler does with each batch.
    #[tokio::test]
    async fn one_at_a_time_acks_walk_the_cursor_to_the_last_document() {
        let (store, docs) = harness();
        let mut options = SubscriptionOptions::default();
        options.max_docs_per_batch = 1;
        let state = SubscriptionState::new("Companies", "");
        store.create(&state).await.unwrap();

        let mut last = None;
        for i in 0..50 {
            last = Some(docs.put(MutationKind::Document, &format!("companies/{i}"), b"{}".to_vec(), None).unwrap());
        }
        let last = last.unwrap();

        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Companies")
            .with_options(&options);
        let mut delivered = 0;
        while let Some(batch) = conn.next_batch().await.unwrap() {
            assert_eq!(batch.items.len(), 1);
            conn.ack(&batch).await.unwrap();
            delivered += 1;
        }
        assert_eq!(delivered, 50);

        let final_state = store.get("Companies").await.unwrap().unwrap();
        assert_eq!(final_state.change_vector_cursor.etag_for(&database()), last.etag);
    }

    #[tokio::test]
    async fn ignore_subscriber_errors_option_round_trips_through_with_options() {
        let (store, docs) = harness();
        let state = SubscriptionState::new("Users", "");
        store.create(&state).await.unwrap();

        let mut options = SubscriptionOptions::default();
        assert!(!options.ignore_subscriber_errors);
        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users")
            .with_options(&options);
        assert!(!conn.ignore_subscriber_errors());

        options.ignore_subscriber_errors = true;
        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users")
            .with_options(&options);
        assert!(conn.ignore_subscriber_errors());
    }

    #[tokio::test]
    async fn disabled_subscription_yields_no_batch() {
        let (store, docs) = harness();
        let mut state = SubscriptionState::new("Users", "");
        state.disabled = true;
        store.create(&state).await.unwrap();
        docs.put(MutationKind::Document, "users/1", b"{}".to_vec(), None).unwrap();

        let conn = SubscriptionConnection::new(store.clone(), docs.clone(), database(), "Users");
        assert!(conn.next_batch().await.unwrap().is_none());
    }
}
