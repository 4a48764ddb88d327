//! Batch change scheduler.
//!
//! Streams every local change newer than the checkpoint as one batch:
//! `BatchChangeStart` with the first page, one `BatchChangeContinue` per
//! further page, then `BatchChangeEnd` stamped with the batch start time.

use crate::context::ReplicationContext;
use crate::error::ReplicationError;
use crate::event::ReplicationEvent;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// How a batch run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The session was not connected, nothing was sent
    Skipped,
    /// The connection dropped part way; the journal keeps what was sent
    Abandoned {
        /// Batch id
        batch_id: String,
    },
    /// Every page and the end marker were sent
    Completed {
        /// Batch id
        batch_id: String,
        /// Pages sent, including the first
        pages: usize,
    },
}

/// Serve batch requests until the task is aborted.
///
/// Requests arriving while a batch runs collapse into one follow-up run.
pub async fn run(ctx: Arc<ReplicationContext>) {
    loop {
        ctx.batch_requested().await;
        match run_batch(&ctx).await {
            Ok(outcome) => tracing::debug!(?outcome, "Batch run finished"),
            Err(err) => {
                tracing::warn!(error = %err, "Batch run failed");
                ctx.post(ReplicationEvent::Error {
                    message: err.to_string(),
                    fatal: false,
                });
            }
        }
    }
}

/// Send one batch of local changes since the checkpoint.
///
/// # Errors
///
/// Returns error if the store fails or a page cannot be sent.
pub async fn run_batch(ctx: &ReplicationContext) -> Result<BatchOutcome, ReplicationError> {
    if !ctx.is_connected() {
        tracing::debug!("Not connected, skipping batch");
        return Ok(BatchOutcome::Skipped);
    }

    let since = ctx.checkpoint().last_sync_time();
    let chunk_size = ctx.config().chunk_size.max(1);

    let first = ctx.changes_since(since, 0, chunk_size)?;
    let start = ctx.factory().create_change_start(first);
    let batch_id = start.header.id.clone();
    let started_at = start.header.timestamp;
    tracing::info!(
        batch_id = %batch_id,
        since,
        changes = start.feed.changes.len(),
        tombstones = start.feed.tombstones.len(),
        "Starting batch"
    );
    ctx.journal().write(&batch_id, &start.feed);
    ctx.send(start)?;

    let mut pages = 1;
    let mut offset = 0;
    let mut ticker = tokio::time::interval(ctx.config().debounce);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !ctx.is_connected() {
            tracing::info!(batch_id = %batch_id, pages, "Connection lost, abandoning batch");
            return Ok(BatchOutcome::Abandoned { batch_id });
        }

        offset += chunk_size;
        let page = ctx.changes_since(since, offset, chunk_size)?;
        if page.changes.is_empty() {
            break;
        }

        let message = ctx.factory().create_change_continue(&batch_id, page);
        tracing::debug!(
            batch_id = %batch_id,
            offset,
            changes = message.feed.changes.len(),
            "Sending batch page"
        );
        ctx.journal().write(&batch_id, &message.feed);
        ctx.send(message)?;
        pages += 1;
    }

    ctx.send(ctx.factory().create_change_end(&batch_id, started_at))?;
    tracing::info!(batch_id = %batch_id, pages, "Batch sent");
    Ok(BatchOutcome::Completed { batch_id, pages })
}
