//! Local change listener.
//!
//! Collection writers notify synchronously; events are queued on a bounded
//! channel and published from a runtime task so a writer never waits on the
//! transport. When the queue is full the event is dropped and the change
//! goes out with the next batch; a dropped removal still records its
//! tombstone.

use crate::context::ReplicationContext;
use crate::error::ReplicationError;
use crate::event::ReplicationEvent;
use replisync_core::{CollectionEvent, CollectionListener, EventKind, LastWriteWinState, Origin};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Forwards local collection events to the publisher task.
///
/// Events written by the replicator are dropped so merged remote changes are
/// not echoed back.
#[derive(Debug)]
pub struct ReplicaChangeListener {
    tx: mpsc::Sender<CollectionEvent>,
    ctx: Weak<ReplicationContext>,
}

impl ReplicaChangeListener {
    /// Create a listener and the receiving end for [`pump`], sized by
    /// `change_capacity`.
    #[must_use]
    pub fn channel(
        ctx: &Arc<ReplicationContext>,
    ) -> (Arc<Self>, mpsc::Receiver<CollectionEvent>) {
        let (tx, rx) = mpsc::channel(ctx.config().change_capacity.max(1));
        let listener = Self {
            tx,
            ctx: Arc::downgrade(ctx),
        };
        (Arc::new(listener), rx)
    }

    fn overflow(&self, event: &CollectionEvent) {
        tracing::warn!(
            id = %event.document.id,
            kind = ?event.kind,
            capacity = self.tx.max_capacity(),
            "Change queue full, change left for next batch"
        );
        if !matches!(event.kind, EventKind::Remove) {
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if let Err(err) =
            ctx.with_crdt(|crdt| crdt.record_tombstone(&event.document.id, event.timestamp))
        {
            tracing::warn!(id = %event.document.id, error = %err, "Failed to record tombstone");
        }
    }
}

impl CollectionListener for ReplicaChangeListener {
    fn on_event(&self, event: &CollectionEvent) {
        if event.origin != Origin::Local {
            return;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.overflow(&event),
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(id = %event.document.id, "Change publisher stopped");
            }
        }
    }
}

/// Publish queued events until the listener is dropped.
pub async fn pump(ctx: Arc<ReplicationContext>, mut rx: mpsc::Receiver<CollectionEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = publish_local_change(&ctx, &event) {
            tracing::warn!(
                id = %event.document.id,
                kind = ?event.kind,
                error = %err,
                "Failed to publish local change"
            );
            ctx.post(ReplicationEvent::Error {
                message: err.to_string(),
                fatal: false,
            });
        }
    }
}

/// Turn one local change into a standalone feed.
///
/// A removal always records its tombstone, even offline, so the next batch
/// carries it. The feed itself is only sent while exchange is enabled.
/// Returns `true` if a feed was sent.
///
/// # Errors
///
/// Returns error if the tombstone cannot be recorded or the feed not sent.
pub fn publish_local_change(
    ctx: &ReplicationContext,
    event: &CollectionEvent,
) -> Result<bool, ReplicationError> {
    let mut state = LastWriteWinState::new();
    match event.kind {
        EventKind::Remove => {
            ctx.with_crdt(|crdt| crdt.record_tombstone(&event.document.id, event.timestamp))?;
            state.add_tombstone(event.document.id.clone(), event.timestamp);
        }
        EventKind::Insert | EventKind::Update => state.add_change(event.document.clone()),
    }

    if !(ctx.exchange_enabled() && ctx.is_connected()) {
        tracing::trace!(id = %event.document.id, "Exchange disabled, change left for next batch");
        return Ok(false);
    }

    let feed = ctx.factory().create_feed_message(state);
    ctx.journal().write(&feed.header.id, &feed.feed);
    ctx.send(feed)?;
    Ok(true)
}
