//! Public replica API.
//!
//! A [`Replica`] binds one collection to one remote endpoint. It owns the
//! transport, the replication context, and two background tasks: the local
//! change pump and the batch scheduler.

use crate::config::{Authentication, ConnectivityChecker, FrameEncoding, ProxyConfig, ReplicaConfig};
use crate::context::{ReplicationContext, REPLICA_ID_ATTRIBUTE};
use crate::dispatcher::MessageDispatcher;
use crate::error::ReplicationError;
use crate::event::ReplicationEvent;
use crate::listener::{self, ReplicaChangeListener};
use crate::persistence::SqliteStore;
use crate::scheduler;
use crate::socket::{ReplicaSocket, Status};
use parking_lot::Mutex;
use replisync_core::{
    now_millis, CollectionEvent, DocumentCollection, LastWriteWinMap, MemoryTombstoneMap,
    StoreResult, TombstoneMap,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Fluent builder for [`Replica`].
#[derive(Default)]
pub struct ReplicaBuilder {
    collection: Option<Arc<dyn DocumentCollection>>,
    tombstones: Option<Arc<dyn TombstoneMap>>,
    remote: Option<String>,
    config: ReplicaConfig,
}

impl ReplicaBuilder {
    /// Start from default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing settings; the endpoint is taken from
    /// `config.socket.url`.
    #[must_use]
    pub fn with_config(mut self, config: ReplicaConfig) -> Self {
        self.remote = Some(config.socket.url.clone());
        self.config = config;
        self
    }

    /// Collection to replicate.
    #[must_use]
    pub fn collection(mut self, collection: Arc<dyn DocumentCollection>) -> Self {
        self.collection = Some(collection);
        self
    }

    /// Tombstone map. Defaults to an in-memory map, which is only allowed
    /// for a collection that is not persistent.
    #[must_use]
    pub fn tombstones(mut self, tombstones: Arc<dyn TombstoneMap>) -> Self {
        self.tombstones = Some(tombstones);
        self
    }

    /// Use a SQLite store as both collection and tombstone map.
    #[must_use]
    pub fn store(self, store: Arc<SqliteStore>) -> Self {
        self.collection(store.clone()).tombstones(store)
    }

    /// Endpoint URL (`ws://` or `wss://`).
    #[must_use]
    pub fn remote(mut self, url: impl Into<String>) -> Self {
        self.remote = Some(url.into());
        self
    }

    /// Authenticate with a JWT bearer token.
    #[must_use]
    pub fn jwt_auth(mut self, token: impl Into<String>) -> Self {
        self.config.socket.auth = Authentication::Bearer(token.into());
        self
    }

    /// Authenticate with HTTP basic credentials.
    #[must_use]
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.socket.auth = Authentication::Basic {
            user: user.into(),
            password: password.into(),
        };
        self
    }

    /// Connect, read, and write timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.socket.connect_timeout = timeout;
        self.config.socket.read_timeout = timeout;
        self.config.socket.write_timeout = timeout;
        self
    }

    /// Documents per batch page.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Delay between batch pages.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    /// Tunnel through an HTTP proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.socket.proxy = Some(proxy);
        self
    }

    /// Skip TLS certificate verification.
    #[must_use]
    pub fn accept_all_certificates(mut self, accept: bool) -> Self {
        self.config.socket.accept_all_certificates = accept;
        self
    }

    /// Network reachability check.
    #[must_use]
    pub fn connectivity_checker(mut self, checker: ConnectivityChecker) -> Self {
        self.config.connectivity = checker;
        self
    }

    /// Fixed replica id.
    #[must_use]
    pub fn replica_id(mut self, id: impl Into<String>) -> Self {
        self.config.replica_id = Some(id.into());
        self
    }

    /// Ping interval while connected.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.socket.heartbeat_interval = interval;
        self
    }

    /// Reconnect backoff step and ceiling.
    #[must_use]
    pub fn reconnect_backoff(mut self, interval: Duration, max: Duration) -> Self {
        self.config.socket.reconnect_interval = interval;
        self.config.socket.reconnect_max = max;
        self
    }

    /// Outbound frame encoding.
    #[must_use]
    pub fn encoding(mut self, encoding: FrameEncoding) -> Self {
        self.config.socket.encoding = encoding;
        self
    }

    /// Build the replica.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the collection or remote is missing, a
    /// persistent collection has no tombstone map, the chunk size is zero,
    /// or the endpoint is invalid. Returns a store error
    /// if the checkpoint or replica id cannot be read.
    pub fn create(self) -> Result<Replica, ReplicationError> {
        let collection = self
            .collection
            .ok_or_else(|| ReplicationError::Config("collection is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| ReplicationError::Config("remote is required".to_string()))?;
        let mut config = self.config;
        if config.chunk_size == 0 {
            return Err(ReplicationError::Config(
                "chunk size must be positive".to_string(),
            ));
        }
        config.socket.url = remote;

        let tombstones = match self.tombstones {
            Some(tombstones) => tombstones,
            None if collection.is_persistent() => {
                return Err(ReplicationError::Config(
                    "a persistent collection needs a persistent tombstone map".to_string(),
                ));
            }
            None => Arc::new(MemoryTombstoneMap::new()),
        };
        let replica_id = resolve_replica_id(collection.as_ref(), config.replica_id.as_deref())?;

        let socket = ReplicaSocket::new(config.socket.clone(), config.connectivity.clone())?;
        let crdt = LastWriteWinMap::new(collection.clone(), tombstones);
        let ctx = Arc::new(ReplicationContext::new(
            config,
            replica_id,
            crdt,
            Arc::new(socket.clone()),
        )?);
        socket.set_listener(Arc::new(MessageDispatcher::new(&ctx)));

        let (listener, changes) = ReplicaChangeListener::channel(&ctx);
        collection.subscribe(listener);

        tracing::info!(
            replica_id = %ctx.replica_id(),
            collection = collection.name(),
            remote = %ctx.config().socket.url,
            "Replica created"
        );

        Ok(Replica {
            ctx,
            socket,
            changes: Mutex::new(Some(changes)),
            pump: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }
}

/// Use the configured id, else the stored one, else a fresh uuid. The
/// result is stored on the collection.
fn resolve_replica_id(
    collection: &dyn DocumentCollection,
    configured: Option<&str>,
) -> StoreResult<String> {
    let stored = collection.attribute(REPLICA_ID_ATTRIBUTE)?;
    let id = match (configured, stored) {
        (Some(id), stored) => {
            if stored.as_deref() != Some(id) {
                collection.set_attribute(REPLICA_ID_ATTRIBUTE, id)?;
            }
            id.to_string()
        }
        (None, Some(id)) => id,
        (None, None) => {
            let id = Uuid::new_v4().to_string();
            collection.set_attribute(REPLICA_ID_ATTRIBUTE, &id)?;
            tracing::info!(replica_id = %id, "Generated replica id");
            id
        }
    };
    Ok(id)
}

/// One collection replicating with one remote endpoint.
pub struct Replica {
    ctx: Arc<ReplicationContext>,
    socket: ReplicaSocket,
    changes: Mutex<Option<mpsc::Receiver<CollectionEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Replica {
    /// Start building a replica.
    #[must_use]
    pub fn builder() -> ReplicaBuilder {
        ReplicaBuilder::new()
    }

    /// Start replication and connect.
    ///
    /// Must be called within a tokio runtime. Returns the transport state
    /// after the first attempt; a failed attempt keeps retrying in the
    /// background.
    pub async fn connect(&self) -> Status {
        if let Some(changes) = self.changes.lock().take() {
            *self.pump.lock() = Some(tokio::spawn(listener::pump(self.ctx.clone(), changes)));
        }
        {
            let mut slot = self.scheduler.lock();
            if slot.as_ref().map_or(true, JoinHandle::is_finished) {
                *slot = Some(tokio::spawn(scheduler::run(self.ctx.clone())));
            }
        }

        self.ctx.post(ReplicationEvent::Started);
        tracing::info!(replica_id = %self.ctx.replica_id(), "Starting replication");
        self.socket.start_connect().await
    }

    /// Tell the remote the session ends and stop replication.
    ///
    /// Local changes keep being recorded and go out with the next batch.
    pub fn disconnect(&self) {
        if self.ctx.is_connected() {
            if let Err(err) = self.ctx.send(self.ctx.factory().create_disconnect()) {
                tracing::debug!(error = %err, "Failed to send disconnect");
            }
        }
        self.ctx.session_lost();
        if let Some(task) = self.scheduler.lock().take() {
            task.abort();
        }
        self.socket.stop_connect("replica disconnected");
        self.ctx.post(ReplicationEvent::Stopped);
        tracing::info!(replica_id = %self.ctx.replica_id(), "Replication stopped");
    }

    /// Disconnect and stop publishing local changes.
    pub fn close(&self) {
        self.disconnect();
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }

    /// Check if the handshake completed and the transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// Transport state.
    #[must_use]
    pub fn status(&self) -> Status {
        self.socket.status()
    }

    /// Subscribe to replication events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.ctx.subscribe()
    }

    /// This replica's id.
    #[must_use]
    pub fn replica_id(&self) -> &str {
        self.ctx.replica_id()
    }

    /// Checkpoint (epoch millis).
    #[must_use]
    pub fn last_sync_time(&self) -> i64 {
        self.ctx.checkpoint().last_sync_time()
    }

    /// Drop tombstones older than `ttl`. Returns the dropped ids.
    ///
    /// # Errors
    ///
    /// Returns error if the tombstone map fails.
    pub fn collect_garbage(&self, ttl: Duration) -> Result<Vec<String>, ReplicationError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let before = now_millis().saturating_sub(ttl_ms);
        let removed = self.ctx.with_crdt(|crdt| crdt.collect_garbage(before))?;
        self.ctx.journal().forget_removed(&removed);
        Ok(removed)
    }

    /// Replication context.
    #[must_use]
    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.ctx
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if let Some(task) = self.scheduler.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.pump.get_mut().take() {
            task.abort();
        }
        self.socket.stop_connect("replica dropped");
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("replica_id", &self.ctx.replica_id())
            .field("status", &self.socket.status())
            .finish_non_exhaustive()
    }
}
