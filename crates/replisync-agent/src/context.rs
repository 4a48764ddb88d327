//! Per-session replication state shared by every handler.

use crate::config::ReplicaConfig;
use crate::error::{ReplicationError, TransportError};
use crate::event::ReplicationEvent;
use crate::journal::FeedJournal;
use crate::socket::ReplicaSocket;
use parking_lot::Mutex;
use replisync_core::{
    DocumentCollection, LastWriteWinMap, LastWriteWinState, MergeStats, StoreError, StoreResult,
};
use replisync_proto::{Message, MessageFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

/// Collection attribute holding the checkpoint.
pub const LAST_SYNCED_ATTRIBUTE: &str = "replisync.last_synced";

/// Collection attribute holding the replica id.
pub const REPLICA_ID_ATTRIBUTE: &str = "replisync.replica_id";

const EVENT_CAPACITY: usize = 64;

/// Outbound side of the transport as seen by handlers.
pub trait MessageSender: Send + Sync {
    /// Hand one message to the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be queued.
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Close the transport.
    fn close(&self, reason: &str);
}

impl MessageSender for ReplicaSocket {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_message(&message)
    }

    fn is_connected(&self) -> bool {
        ReplicaSocket::is_connected(self)
    }

    fn close(&self, reason: &str) {
        self.stop_connect(reason);
    }
}

/// Persisted high-water mark of synchronized state.
///
/// `last_sync_time` never decreases. `accepting` gates whether an inbound
/// feed may move it.
pub struct Checkpoint {
    collection: Arc<dyn DocumentCollection>,
    last_sync_time: Mutex<i64>,
    accepting: AtomicBool,
}

impl Checkpoint {
    /// Load the checkpoint stored on a collection.
    ///
    /// # Errors
    ///
    /// Returns error if the attribute cannot be read or parsed.
    pub fn load(collection: Arc<dyn DocumentCollection>) -> StoreResult<Self> {
        let last_sync_time = match collection.attribute(LAST_SYNCED_ATTRIBUTE)? {
            Some(value) => value.parse().map_err(|e| {
                StoreError::Encoding(format!("{LAST_SYNCED_ATTRIBUTE}='{value}': {e}"))
            })?,
            None => 0,
        };
        Ok(Self {
            collection,
            last_sync_time: Mutex::new(last_sync_time),
            accepting: AtomicBool::new(false),
        })
    }

    /// Current checkpoint (epoch millis).
    #[must_use]
    pub fn last_sync_time(&self) -> i64 {
        *self.last_sync_time.lock()
    }

    /// Move the checkpoint forward. Returns `false` if `timestamp` is not
    /// newer than the current value.
    ///
    /// # Errors
    ///
    /// Returns error if the attribute cannot be written.
    pub fn advance(&self, timestamp: i64) -> StoreResult<bool> {
        let mut current = self.last_sync_time.lock();
        if timestamp <= *current {
            return Ok(false);
        }
        self.collection
            .set_attribute(LAST_SYNCED_ATTRIBUTE, &timestamp.to_string())?;
        *current = timestamp;
        tracing::debug!(
            collection = self.collection.name(),
            last_sync_time = timestamp,
            "Advanced checkpoint"
        );
        Ok(true)
    }

    /// Check if inbound feeds may advance the checkpoint.
    #[must_use]
    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Allow or forbid inbound feeds to advance the checkpoint.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("last_sync_time", &self.last_sync_time())
            .field("accepting", &self.accepting())
            .finish_non_exhaustive()
    }
}

/// Everything a handler needs: identity, merge engine, journal, factory,
/// transport, and checkpoint.
///
/// Merges go through a mutex so concurrent feeds for the same collection
/// cannot interleave their read-then-write sequences.
pub struct ReplicationContext {
    config: ReplicaConfig,
    replica_id: String,
    crdt: Mutex<LastWriteWinMap>,
    journal: FeedJournal,
    factory: MessageFactory,
    sender: Arc<dyn MessageSender>,
    checkpoint: Checkpoint,
    connected: AtomicBool,
    exchange: AtomicBool,
    events: broadcast::Sender<ReplicationEvent>,
    batch_requests: Notify,
}

impl ReplicationContext {
    /// Assemble a context.
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoint cannot be loaded.
    pub fn new(
        config: ReplicaConfig,
        replica_id: String,
        crdt: LastWriteWinMap,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self, ReplicationError> {
        let checkpoint = Checkpoint::load(crdt.collection().clone())?;
        let factory = MessageFactory::new(
            replica_id.clone(),
            crdt.collection().name(),
            config.socket.auth.user_name(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            replica_id,
            crdt: Mutex::new(crdt),
            journal: FeedJournal::new(),
            factory,
            sender,
            checkpoint,
            connected: AtomicBool::new(false),
            exchange: AtomicBool::new(false),
            events,
            batch_requests: Notify::new(),
        })
    }

    /// Replica settings.
    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// This replica's id.
    #[must_use]
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Outstanding-id journal.
    #[must_use]
    pub fn journal(&self) -> &FeedJournal {
        &self.journal
    }

    /// Message factory.
    #[must_use]
    pub fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Checkpoint state.
    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Run `f` with exclusive access to the merge engine.
    pub fn with_crdt<R>(&self, f: impl FnOnce(&LastWriteWinMap) -> R) -> R {
        f(&self.crdt.lock())
    }

    /// Merge a remote state.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn merge(&self, state: &LastWriteWinState) -> StoreResult<MergeStats> {
        self.with_crdt(|crdt| crdt.merge(state))
    }

    /// One page of local changes.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn changes_since(
        &self,
        since: i64,
        offset: usize,
        size: usize,
    ) -> StoreResult<LastWriteWinState> {
        self.with_crdt(|crdt| crdt.get_changes_since(since, offset, size))
    }

    /// Send a message through the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the message.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        self.sender.send(message.into())
    }

    /// Check if the handshake completed and the transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.sender.is_connected()
    }

    /// Record handshake completion.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Check if local changes are streamed as feeds.
    #[must_use]
    pub fn exchange_enabled(&self) -> bool {
        self.exchange.load(Ordering::SeqCst)
    }

    /// Enable or disable feed exchange.
    pub fn set_exchange(&self, enabled: bool) {
        self.exchange.store(enabled, Ordering::SeqCst);
    }

    /// Reset session flags after the connection or session ends.
    pub fn session_lost(&self) {
        self.set_connected(false);
        self.set_exchange(false);
        self.checkpoint.set_accepting(false);
    }

    /// Ask the scheduler to send a batch.
    pub fn request_batch(&self) {
        self.batch_requests.notify_one();
    }

    /// Wait for a batch request.
    pub async fn batch_requested(&self) {
        self.batch_requests.notified().await;
    }

    /// Publish an event. Dropped when nobody listens.
    pub fn post(&self, event: ReplicationEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Stop replication because of a fatal error.
    pub fn halt(&self, error: &ReplicationError) {
        tracing::error!(replica_id = %self.replica_id, error = %error, "Stopping replication");
        self.session_lost();
        self.post(ReplicationEvent::Error {
            message: error.to_string(),
            fatal: true,
        });
        self.sender.close("fatal replication error");
        self.post(ReplicationEvent::Stopped);
    }
}

impl std::fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("replica_id", &self.replica_id)
            .field("collection", &self.factory.collection_name())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("checkpoint", &self.checkpoint)
            .finish_non_exhaustive()
    }
}
