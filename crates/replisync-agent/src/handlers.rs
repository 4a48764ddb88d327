//! Protocol handlers: one function per message type.
//!
//! Sender's view of one batch:
//!
//! ```text
//! Start ─ack─▶ Continue* ─acks─▶ End ─EndAck─▶ retry what no ack covered
//! ```
//!
//! Feed-bearing messages are merged before they are acknowledged, so a
//! storage failure suppresses the ack and leaves the ids in the sender's
//! journal for a later retry.

use crate::context::ReplicationContext;
use crate::error::ReplicationError;
use crate::event::ReplicationEvent;
use replisync_core::LastWriteWinState;
use replisync_proto::{
    BatchAck, BatchChangeContinue, BatchChangeEnd, BatchChangeStart, BatchEndAck, Connect,
    ConnectAck, DataGateFeed, DataGateFeedAck, Disconnect, DisconnectAck, ErrorMessage, Message,
    MessageHeader, Receipt, ReceiptAware,
};

/// Route one inbound message to its handler.
///
/// Messages that originate from this replica, or that belong to another
/// collection, are dropped.
///
/// # Errors
///
/// Returns the handler's error.
pub fn dispatch(ctx: &ReplicationContext, message: Message) -> Result<(), ReplicationError> {
    let header = message.header();
    if header.origin == ctx.replica_id() {
        tracing::debug!(id = %header.id, "Ignoring own message");
        return Ok(());
    }
    if header.collection_name != ctx.factory().collection_name() {
        tracing::warn!(
            id = %header.id,
            collection = %header.collection_name,
            "Ignoring message for another collection"
        );
        return Ok(());
    }

    tracing::debug!(
        id = %header.id,
        origin = %header.origin,
        message_type = %header.message_type,
        "Handling message"
    );

    match message {
        Message::Connect(m) => handle_connect(ctx, &m),
        Message::ConnectAck(m) => handle_connect_ack(ctx, &m),
        Message::Disconnect(m) => handle_disconnect(ctx, &m),
        Message::DisconnectAck(m) => {
            handle_disconnect_ack(ctx, &m);
            Ok(())
        }
        Message::BatchChangeStart(m) => handle_batch_change_start(ctx, &m),
        Message::BatchChangeContinue(m) => handle_batch_change_continue(ctx, &m),
        Message::BatchChangeEnd(m) => handle_batch_change_end(ctx, &m),
        Message::BatchAck(m) => {
            handle_batch_ack(ctx, &m);
            Ok(())
        }
        Message::BatchEndAck(m) => handle_batch_end_ack(ctx, &m),
        Message::DataGateFeed(m) => handle_feed(ctx, &m),
        Message::DataGateFeedAck(m) => {
            handle_feed_ack(ctx, &m);
            Ok(())
        }
        Message::Error(m) => handle_error(ctx, &m),
    }
}

/// Reply `ConnectAck`, open the session, and schedule a batch.
///
/// # Errors
///
/// Returns error if the reply cannot be sent.
pub fn handle_connect(ctx: &ReplicationContext, message: &Connect) -> Result<(), ReplicationError> {
    ctx.send(ctx.factory().create_connect_ack(&message.header.id))?;
    ctx.set_connected(true);
    ctx.set_exchange(true);
    ctx.request_batch();
    Ok(())
}

/// Open the session, resend whatever is still outstanding, and schedule a
/// batch.
///
/// # Errors
///
/// Returns error if the retry feed cannot be built or sent.
pub fn handle_connect_ack(
    ctx: &ReplicationContext,
    _message: &ConnectAck,
) -> Result<(), ReplicationError> {
    ctx.set_connected(true);
    ctx.set_exchange(true);
    ctx.post(ReplicationEvent::Connected);
    tracing::info!(replica_id = %ctx.replica_id(), "Replication session established");

    let (keys, outstanding) = ctx.journal().outstanding();
    let retried = retry_and_retire(ctx, &keys, Some(&outstanding));
    ctx.request_batch();
    retried
}

/// Reply `DisconnectAck` and stop exchanging feeds.
///
/// # Errors
///
/// Returns error if the reply cannot be sent.
pub fn handle_disconnect(
    ctx: &ReplicationContext,
    message: &Disconnect,
) -> Result<(), ReplicationError> {
    ctx.session_lost();
    ctx.send(ctx.factory().create_disconnect_ack(&message.header.id))?;
    tracing::info!(origin = %message.header.origin, "Remote ended the session");
    Ok(())
}

/// Nothing to do beyond logging.
pub fn handle_disconnect_ack(_ctx: &ReplicationContext, message: &DisconnectAck) {
    tracing::debug!(origin = %message.header.origin, "Disconnect acknowledged");
}

/// Merge the first page of a batch and acknowledge it.
///
/// # Errors
///
/// Returns error if the merge or the ack fails.
pub fn handle_batch_change_start(
    ctx: &ReplicationContext,
    message: &BatchChangeStart,
) -> Result<(), ReplicationError> {
    merge_and_ack_page(ctx, &message.header, message)
}

/// Merge a subsequent page of a batch and acknowledge it.
///
/// # Errors
///
/// Returns error if the merge or the ack fails.
pub fn handle_batch_change_continue(
    ctx: &ReplicationContext,
    message: &BatchChangeContinue,
) -> Result<(), ReplicationError> {
    merge_and_ack_page(ctx, &message.header, message)
}

fn merge_and_ack_page(
    ctx: &ReplicationContext,
    header: &MessageHeader,
    message: &impl ReceiptAware,
) -> Result<(), ReplicationError> {
    let receipt = merge_feed(ctx, header, message)?;
    let ack = ctx
        .factory()
        .create_batch_ack(header.correlation_id.as_deref(), &header.id, receipt);
    ctx.send(ack)?;
    Ok(())
}

fn merge_feed(
    ctx: &ReplicationContext,
    header: &MessageHeader,
    message: &impl ReceiptAware,
) -> Result<Receipt, ReplicationError> {
    let stats = ctx.merge(message.feed())?;
    tracing::debug!(
        id = %header.id,
        origin = %header.origin,
        applied_puts = stats.applied_puts,
        applied_removes = stats.applied_removes,
        "Merged remote feed"
    );
    Ok(message.calculate_receipt())
}

/// Acknowledge the end of a batch and move the checkpoint to its start time.
///
/// # Errors
///
/// Returns error if the ack cannot be sent or the checkpoint not persisted.
pub fn handle_batch_change_end(
    ctx: &ReplicationContext,
    message: &BatchChangeEnd,
) -> Result<(), ReplicationError> {
    let header = &message.header;
    ctx.send(
        ctx.factory()
            .create_batch_end_ack(header.correlation_id.as_deref(), &header.id),
    )?;
    ctx.checkpoint().advance(header.timestamp)?;
    ctx.checkpoint().set_accepting(true);
    Ok(())
}

/// Clear the ids a page receipt covers from the journal.
pub fn handle_batch_ack(ctx: &ReplicationContext, message: &BatchAck) {
    let key = message
        .header
        .correlation_id
        .as_deref()
        .unwrap_or(&message.correlation_id);
    if !ctx.journal().acknowledge(key, &message.receipt) {
        tracing::debug!(batch_id = key, "Ack for a closed batch");
    }
}

/// Close the batch and resend whatever no page ack covered.
///
/// # Errors
///
/// Returns error if the retry feed cannot be built or sent.
pub fn handle_batch_end_ack(
    ctx: &ReplicationContext,
    message: &BatchEndAck,
) -> Result<(), ReplicationError> {
    let key = message
        .header
        .correlation_id
        .as_deref()
        .unwrap_or(&message.correlation_id);
    let pending = ctx.journal().pending(key);
    retry_and_retire(ctx, &[key.to_string()], pending.as_ref())
}

/// Merge a standalone feed, acknowledge it, and move the checkpoint when
/// the session allows it.
///
/// # Errors
///
/// Returns error if the merge, the ack, or the checkpoint write fails.
pub fn handle_feed(ctx: &ReplicationContext, message: &DataGateFeed) -> Result<(), ReplicationError> {
    let receipt = merge_feed(ctx, &message.header, message)?;
    ctx.send(ctx.factory().create_feed_ack(&message.header.id, receipt))?;
    if ctx.checkpoint().accepting() {
        ctx.checkpoint().advance(message.header.timestamp)?;
    }
    Ok(())
}

/// Clear the ids a feed receipt covers from the journal.
pub fn handle_feed_ack(ctx: &ReplicationContext, message: &DataGateFeedAck) {
    if !ctx
        .journal()
        .acknowledge(&message.correlation_id, &message.receipt)
    {
        tracing::debug!(feed_id = %message.correlation_id, "Ack for a closed feed");
    }
}

/// Surface a remote error.
///
/// # Errors
///
/// Always returns [`ReplicationError::Remote`]; fatal when the remote says so.
pub fn handle_error(
    _ctx: &ReplicationContext,
    message: &ErrorMessage,
) -> Result<(), ReplicationError> {
    Err(ReplicationError::Remote {
        message: message.error.clone(),
        fatal: message.fatal,
    })
}

/// Resend `pending`, then close the journal entries under `keys`.
///
/// A store failure leaves the entries open for the next retry. Once the
/// retry feed is journaled the old entries are closed even if sending fails.
fn retry_and_retire(
    ctx: &ReplicationContext,
    keys: &[String],
    pending: Option<&Receipt>,
) -> Result<(), ReplicationError> {
    match retry_failed(ctx, pending) {
        Err(err @ ReplicationError::Store(_)) => {
            tracing::warn!(entries = keys.len(), error = %err, "Retry postponed");
            Err(err)
        }
        result => {
            ctx.journal().retire(keys);
            result.map(|_| ())
        }
    }
}

/// Resend the current state of every id in `receipt`.
///
/// Documents and tombstones are re-read so the feed carries the latest
/// local truth; ids that no longer exist are skipped. When none is left no
/// feed is sent. Returns `true` if a feed was sent.
///
/// # Errors
///
/// Returns error if the store fails or the feed cannot be sent.
pub fn retry_failed(
    ctx: &ReplicationContext,
    receipt: Option<&Receipt>,
) -> Result<bool, ReplicationError> {
    let Some(receipt) = receipt.filter(|receipt| !receipt.is_empty()) else {
        return Ok(false);
    };

    let state = ctx.with_crdt(|crdt| {
        let mut state = LastWriteWinState::new();
        for id in &receipt.added {
            if let Some(document) = crdt.document(id)? {
                state.add_change(document);
            }
        }
        for id in &receipt.removed {
            if let Some(deleted_at) = crdt.tombstone(id)? {
                state.add_tombstone(id.clone(), deleted_at);
            }
        }
        Ok::<_, ReplicationError>(state)
    })?;

    if state.is_empty() {
        tracing::debug!("Nothing left to retry");
        return Ok(false);
    }

    let feed = ctx.factory().create_feed_message(state);
    tracing::info!(
        feed_id = %feed.header.id,
        changes = feed.feed.changes.len(),
        tombstones = feed.feed.tombstones.len(),
        "Retrying unacknowledged changes"
    );
    ctx.journal().write(&feed.header.id, &feed.feed);
    ctx.send(feed)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::context::MessageSender;
    use crate::error::TransportError;
    use parking_lot::Mutex;
    use replisync_core::{
        Document, DocumentCollection, LastWriteWinMap, MemoryCollection, MemoryTombstoneMap,
        Origin, StoreError, StoreResult, TombstoneMap,
    };
    use replisync_proto::{MessageFactory, MessageType};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Message>>,
        down: AtomicBool,
    }

    impl RecordingSender {
        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: Message) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(message);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }

        fn close(&self, _reason: &str) {
            self.down.store(true, Ordering::SeqCst);
        }
    }

    /// Tombstone map whose writes fail.
    struct BrokenTombstones;

    /// Tombstone map whose reads fail.
    struct UnreadableTombstones;

    impl TombstoneMap for UnreadableTombstones {
        fn get(&self, _id: &str) -> StoreResult<Option<i64>> {
            Err(StoreError::Backend("io error".into()))
        }
        fn put(&self, _id: &str, _deleted_at: i64) -> StoreResult<()> {
            Ok(())
        }
        fn remove(&self, _id: &str) -> StoreResult<Option<i64>> {
            Ok(None)
        }
        fn entries(&self) -> StoreResult<Vec<(String, i64)>> {
            Ok(Vec::new())
        }
    }

    impl TombstoneMap for BrokenTombstones {
        fn get(&self, _id: &str) -> StoreResult<Option<i64>> {
            Ok(None)
        }
        fn put(&self, _id: &str, _deleted_at: i64) -> StoreResult<()> {
            Err(StoreError::Backend("disk full".into()))
        }
        fn remove(&self, _id: &str) -> StoreResult<Option<i64>> {
            Ok(None)
        }
        fn entries(&self) -> StoreResult<Vec<(String, i64)>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        collection: Arc<MemoryCollection>,
        sender: Arc<RecordingSender>,
        ctx: ReplicationContext,
        remote: MessageFactory,
    }

    fn fixture_with(tombstones: Arc<dyn TombstoneMap>) -> Fixture {
        let collection = Arc::new(MemoryCollection::new("todos"));
        let sender = Arc::new(RecordingSender::default());
        let crdt = LastWriteWinMap::new(collection.clone(), tombstones);
        let ctx = ReplicationContext::new(
            ReplicaConfig::default(),
            "local".to_string(),
            crdt,
            sender.clone(),
        )
        .unwrap();
        ctx.set_connected(true);
        Fixture {
            collection,
            sender,
            ctx,
            remote: MessageFactory::new("remote", "todos", None),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryTombstoneMap::new()))
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn feed(changes: Vec<Document>, tombstones: &[(&str, i64)]) -> LastWriteWinState {
        let mut state = LastWriteWinState::new();
        for doc in changes {
            state.add_change(doc);
        }
        for (id, ts) in tombstones {
            state.add_tombstone(*id, *ts);
        }
        state
    }

    #[test]
    fn batch_start_is_merged_then_acknowledged_with_payload_receipt() {
        let f = fixture();
        let start = f.remote.create_change_start(feed(
            vec![Document::new("a", 10), Document::new("b", 20)],
            &[("x", 5)],
        ));

        dispatch(&f.ctx, start.clone().into()).unwrap();

        assert!(f.collection.get_by_id("a").unwrap().is_some());
        let sent = f.sender.take();
        let [Message::BatchAck(ack)] = sent.as_slice() else {
            panic!("expected one BatchAck, got {sent:?}");
        };
        assert_eq!(ack.correlation_id, start.header.id);
        assert_eq!(ack.header.correlation_id, start.header.correlation_id);
        assert_eq!(ack.receipt.added, ids(&["a", "b"]));
        assert_eq!(ack.receipt.removed, ids(&["x"]));
    }

    #[test]
    fn storage_failure_suppresses_the_ack() {
        let f = fixture_with(Arc::new(BrokenTombstones));
        f.collection
            .insert(Document::new("x", 1), Origin::Local)
            .unwrap();
        let page = f
            .remote
            .create_change_continue("batch-1", feed(vec![], &[("x", 5)]));

        let err = dispatch(&f.ctx, page.into()).unwrap_err();
        assert!(matches!(err, ReplicationError::Store(_)));
        assert!(!err.is_fatal());
        assert!(f.sender.take().is_empty());
    }

    #[test]
    fn batch_end_acks_and_moves_checkpoint() {
        let f = fixture();
        let end = f.remote.create_change_end("batch-1", 1_000);

        dispatch(&f.ctx, end.clone().into()).unwrap();

        let sent = f.sender.take();
        let [Message::BatchEndAck(ack)] = sent.as_slice() else {
            panic!("expected BatchEndAck, got {sent:?}");
        };
        assert_eq!(ack.correlation_id, end.header.id);
        assert_eq!(ack.header.correlation_id.as_deref(), Some("batch-1"));
        assert_eq!(f.ctx.checkpoint().last_sync_time(), 1_000);
        assert!(f.ctx.checkpoint().accepting());

        // An older end never moves the checkpoint back
        dispatch(&f.ctx, f.remote.create_change_end("batch-0", 500).into()).unwrap();
        assert_eq!(f.ctx.checkpoint().last_sync_time(), 1_000);
    }

    #[test]
    fn feed_moves_checkpoint_only_when_accepting() {
        let f = fixture();
        let first = f.remote.create_feed_message(feed(vec![Document::new("a", 1)], &[]));
        dispatch(&f.ctx, first.clone().into()).unwrap();
        assert_eq!(f.ctx.checkpoint().last_sync_time(), 0);

        let sent = f.sender.take();
        let [Message::DataGateFeedAck(ack)] = sent.as_slice() else {
            panic!("expected DataGateFeedAck, got {sent:?}");
        };
        assert_eq!(ack.correlation_id, first.header.id);
        assert_eq!(ack.receipt.added, ids(&["a"]));

        f.ctx.checkpoint().set_accepting(true);
        let second = f.remote.create_feed_message(feed(vec![Document::new("b", 2)], &[]));
        dispatch(&f.ctx, second.clone().into()).unwrap();
        assert_eq!(f.ctx.checkpoint().last_sync_time(), second.header.timestamp);
    }

    #[test]
    fn retry_reflects_current_truth() {
        let f = fixture();
        f.collection
            .insert(Document::new("a", 10).with("v", "latest"), Origin::Local)
            .unwrap();
        // "b" was deleted locally before the retry fired

        let receipt = Receipt::new(ids(&["a", "b"]), BTreeSet::new());
        assert!(retry_failed(&f.ctx, Some(&receipt)).unwrap());

        let sent = f.sender.take();
        let [Message::DataGateFeed(retry)] = sent.as_slice() else {
            panic!("expected DataGateFeed, got {sent:?}");
        };
        assert_eq!(retry.feed.change_ids(), ids(&["a"]));
        assert_eq!(retry.feed.changes[0].get("v").unwrap(), "latest");
        assert!(retry.feed.tombstones.is_empty());
        assert_eq!(
            f.ctx.journal().pending(&retry.header.id).unwrap().added,
            ids(&["a"])
        );
    }

    #[test]
    fn retry_skips_empty_receipts() {
        let f = fixture();
        assert!(!retry_failed(&f.ctx, None).unwrap());
        assert!(!retry_failed(&f.ctx, Some(&Receipt::default())).unwrap());
        let gone = Receipt::new(ids(&["missing"]), ids(&["never-deleted"]));
        assert!(!retry_failed(&f.ctx, Some(&gone)).unwrap());
        assert!(f.sender.take().is_empty());
    }

    #[test]
    fn batch_end_ack_retries_unacknowledged_ids() {
        let f = fixture();
        f.collection
            .insert(Document::new("a", 1), Origin::Local)
            .unwrap();
        f.collection
            .insert(Document::new("b", 2), Origin::Local)
            .unwrap();

        let ours = f.ctx.factory().clone();
        let start = ours.create_change_start(feed(
            vec![Document::new("a", 1), Document::new("b", 2)],
            &[],
        ));
        let batch_id = start.header.id.clone();
        f.ctx.journal().write(&batch_id, &start.feed);

        let ack = f.remote.create_batch_ack(
            Some(&batch_id),
            &start.header.id,
            Receipt::new(ids(&["a"]), BTreeSet::new()),
        );
        dispatch(&f.ctx, ack.into()).unwrap();

        let end_ack = f.remote.create_batch_end_ack(Some(&batch_id), "end-1");
        dispatch(&f.ctx, end_ack.into()).unwrap();

        let sent = f.sender.take();
        let [Message::DataGateFeed(retry)] = sent.as_slice() else {
            panic!("expected retry feed, got {sent:?}");
        };
        assert_eq!(retry.feed.change_ids(), ids(&["b"]));
        assert!(f.ctx.journal().pending(&batch_id).is_none());
    }

    #[test]
    fn unreadable_store_keeps_outstanding_ids() {
        let f = fixture_with(Arc::new(UnreadableTombstones));
        f.ctx.set_connected(false);
        f.ctx
            .journal()
            .write("feed-1", &feed(vec![Document::new("a", 1)], &[("x", 2)]));

        let err = dispatch(&f.ctx, f.remote.create_connect_ack("c-1").into()).unwrap_err();
        assert!(matches!(err, ReplicationError::Store(_)));
        assert!(f.ctx.is_connected());

        let pending = f.ctx.journal().pending("feed-1").unwrap();
        assert_eq!(pending.added, ids(&["a"]));
        assert_eq!(pending.removed, ids(&["x"]));
        assert!(f.sender.take().is_empty());

        let end_ack = f.remote.create_batch_end_ack(Some("feed-1"), "end-1");
        assert!(dispatch(&f.ctx, end_ack.into()).is_err());
        assert!(f.ctx.journal().pending("feed-1").is_some());
    }

    #[test]
    fn feed_ack_clears_journal() {
        let f = fixture();
        f.ctx
            .journal()
            .write("feed-1", &feed(vec![Document::new("a", 1)], &[]));

        let ack = f
            .remote
            .create_feed_ack("feed-1", Receipt::new(ids(&["a"]), BTreeSet::new()));
        dispatch(&f.ctx, ack.into()).unwrap();

        assert!(f.ctx.journal().is_empty());
    }

    #[test]
    fn connect_ack_opens_session_and_resends_outstanding() {
        let f = fixture();
        f.ctx.set_connected(false);
        f.collection
            .insert(Document::new("pending", 1), Origin::Local)
            .unwrap();
        f.ctx
            .journal()
            .write("old-batch", &feed(vec![Document::new("pending", 1)], &[]));
        let mut events = f.ctx.subscribe();

        let connect_ack = f.remote.create_connect_ack("c-1");
        dispatch(&f.ctx, connect_ack.into()).unwrap();

        assert!(f.ctx.is_connected());
        assert!(f.ctx.exchange_enabled());
        assert_eq!(events.try_recv().unwrap(), ReplicationEvent::Connected);

        let sent = f.sender.take();
        let [Message::DataGateFeed(retry)] = sent.as_slice() else {
            panic!("expected retry feed, got {sent:?}");
        };
        assert_eq!(retry.feed.change_ids(), ids(&["pending"]));
        assert!(f.ctx.journal().pending("old-batch").is_none());
    }

    #[test]
    fn connect_is_acknowledged() {
        let f = fixture();
        f.ctx.set_connected(false);
        let connect = f.remote.create_connect(Some("Bearer tok".into()));

        dispatch(&f.ctx, connect.clone().into()).unwrap();

        let sent = f.sender.take();
        let [Message::ConnectAck(ack)] = sent.as_slice() else {
            panic!("expected ConnectAck, got {sent:?}");
        };
        assert_eq!(ack.header.correlation_id.as_deref(), Some(connect.header.id.as_str()));
        assert!(f.ctx.is_connected());
    }

    #[test]
    fn disconnect_ends_the_session() {
        let f = fixture();
        f.ctx.set_exchange(true);

        dispatch(&f.ctx, f.remote.create_disconnect().into()).unwrap();

        assert!(!f.ctx.exchange_enabled());
        assert!(!f.ctx.is_connected());
        let sent = f.sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), MessageType::DisconnectAck);
    }

    #[test]
    fn own_and_foreign_messages_are_ignored() {
        let f = fixture();
        let own = f.ctx.factory().create_feed_message(feed(vec![Document::new("a", 1)], &[]));
        dispatch(&f.ctx, own.into()).unwrap();

        let other_collection = MessageFactory::new("remote", "notes", None)
            .create_feed_message(feed(vec![Document::new("b", 1)], &[]));
        dispatch(&f.ctx, other_collection.into()).unwrap();

        assert!(f.collection.is_empty().unwrap());
        assert!(f.sender.take().is_empty());
    }

    #[test]
    fn remote_errors_carry_fatality() {
        let f = fixture();
        let soft = f.remote.create_error(None, "slow down", false);
        let hard = f.remote.create_error(None, "unauthorized", true);

        assert!(!dispatch(&f.ctx, soft.into()).unwrap_err().is_fatal());
        assert!(dispatch(&f.ctx, hard.into()).unwrap_err().is_fatal());
    }
}
