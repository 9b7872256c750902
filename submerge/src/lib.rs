//! A server collects together all resources necessary to function as a
//! replica of this database's buckets and to support replication to and
//! subscription delivery for its peers.
//!
//! A server may support one or more clients, or it may be configured
//! strictly as an unloaded replica for redundancy.
//!
//! A server may be an active or passive replica. Active replicas
//! participate in the replicated commit protocol, and therefore wait for
//! one another (or at least a quorum of one another). Passive replicas can
//! lag behind active replicas, can store and flood low-consistency data,
//! but cannot initiate high-consistency write transactions (§4.4's
//! `LoaderState::Active`/`Passive`).

mod config;
mod listener;
mod reconcile;

pub use config::{ConfigError, NodeConfig, SubscriptionDefaults};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use submerge_base::{DatabaseId, NodeTag};
use submerge_cluster::InMemoryConsensusLog;
use submerge_repl::ReplicationLoader;
use submerge_store::{ChangeLogIndex, MemoryDocumentStore};
use submerge_sub::{SubscriptionStore, SubscriptionSupervisor};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("binding listen address {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("opening change log index: {0}")]
    Index(#[from] submerge_store::StoreError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Idle = 0,
    Running = 1,
}

impl From<u8> for ServerState {
    fn from(v: u8) -> Self {
        match v {
            1 => ServerState::Running,
            _ => ServerState::Idle,
        }
    }
}

/// Everything the listener and reconcile loop share: one document store,
/// one consensus log, one replication loader, one subscription store and
/// supervisor, all scoped to this node's single database (§4.12 -- a node
/// hosts exactly one database replica in this reference implementation).
pub struct NodeContext {
    pub node_tag: NodeTag,
    pub database_id: DatabaseId,
    pub config: NodeConfig,
    pub document_store: Arc<MemoryDocumentStore>,
    pub consensus_log: Arc<InMemoryConsensusLog>,
    pub replication_loader: Arc<ReplicationLoader>,
    pub subscription_store: Arc<SubscriptionStore<InMemoryConsensusLog>>,
    pub subscription_supervisor: Arc<SubscriptionSupervisor>,
}

pub struct Server {
    pub ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    state: AtomicU8,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Binds the listener and spawns the accept loop and the reconcile
    /// loop, matching §4.4's "initialize, then reconcile on every database
    /// record change" discipline -- here driven by polling rather than a
    /// real consensus log subscription, since `InMemoryConsensusLog` has
    /// none.
    pub async fn start(config: NodeConfig) -> Result<Self, StartError> {
        if config.bucket_count != submerge_store::BUCKET_COUNT {
            tracing::warn!(
                configured = config.bucket_count,
                actual = submerge_store::BUCKET_COUNT,
                "configured bucket_count does not match the compiled-in routing constant"
            );
        }

        let node_tag = config.node_tag();
        let database_id = config.database_id();

        let listener = TcpListener::bind(&config.listen_address).await.map_err(|e| StartError::Bind {
            address: config.listen_address.clone(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| StartError::Bind {
            address: config.listen_address.clone(),
            source: e,
        })?;

        let index = ChangeLogIndex::in_memory()?;
        let document_store = Arc::new(MemoryDocumentStore::new(database_id.clone(), index));
        let consensus_log = Arc::new(InMemoryConsensusLog::new(submerge_cluster::DatabaseRecord {
            this_database_id: Some(database_id.clone()),
            ..Default::default()
        }));
        let replication_loader = Arc::new(ReplicationLoader::new(
            node_tag.clone(),
            database_id.clone(),
            config.max_timeout_cap,
        ));
        let subscription_store = Arc::new(SubscriptionStore::new(consensus_log.clone(), database_id.clone()));
        let subscription_supervisor = Arc::new(SubscriptionSupervisor::new());

        let ctx = Arc::new(NodeContext {
            node_tag,
            database_id,
            config,
            document_store,
            consensus_log,
            replication_loader,
            subscription_store,
            subscription_supervisor,
        });

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(listener::accept_loop(ctx.clone(), listener, shutdown.clone())));
        tasks.push(tokio::spawn(reconcile::reconcile_loop(ctx.clone(), shutdown.clone())));

        tracing::info!(node = %ctx.node_tag, database = %ctx.database_id, address = %local_addr, "server started");

        Ok(Server {
            ctx,
            local_addr,
            state: AtomicU8::new(ServerState::Running as u8),
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::SeqCst))
    }

    /// Cancels the accept and reconcile loops and waits for them to exit.
    /// In-flight connections are cancelled too (`OutboundWorker`/handler
    /// loops watch the same token).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.state.store(ServerState::Idle as u8, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}
