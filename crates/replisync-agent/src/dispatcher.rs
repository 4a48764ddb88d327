//! Bridges transport callbacks to the protocol handlers.

use crate::context::ReplicationContext;
use crate::event::ReplicationEvent;
use crate::handlers;
use crate::socket::SocketListener;
use replisync_proto::Message;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Socket listener that drives a replication session.
///
/// Holds the context weakly: the context owns the socket, and the socket
/// owns its listener.
pub struct MessageDispatcher {
    ctx: Weak<ReplicationContext>,
}

impl MessageDispatcher {
    /// Create a dispatcher for `ctx`.
    #[must_use]
    pub fn new(ctx: &Arc<ReplicationContext>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
        }
    }

    fn context(&self) -> Option<Arc<ReplicationContext>> {
        self.ctx.upgrade()
    }
}

impl SocketListener for MessageDispatcher {
    fn on_open(&self) {
        let Some(ctx) = self.context() else {
            return;
        };
        let token = ctx.config().socket.auth.header_value();
        let connect = ctx.factory().create_connect(token);
        tracing::debug!(id = %connect.header.id, "Sending connect");
        if let Err(err) = ctx.send(connect) {
            tracing::warn!(error = %err, "Failed to send connect");
        }
    }

    fn on_message(&self, message: Message) {
        let Some(ctx) = self.context() else {
            return;
        };
        let id = message.header().id.clone();
        let message_type = message.message_type();

        if let Err(err) = handlers::dispatch(&ctx, message) {
            if err.is_fatal() {
                ctx.halt(&err);
            } else {
                tracing::warn!(
                    id = %id,
                    message_type = %message_type,
                    error = %err,
                    "Failed to handle message"
                );
                ctx.post(ReplicationEvent::Error {
                    message: err.to_string(),
                    fatal: false,
                });
            }
        }
    }

    fn on_closed(&self, code: u16, reason: &str) {
        if let Some(ctx) = self.context() {
            tracing::debug!(code, reason, "Session closed");
            ctx.session_lost();
        }
    }

    fn on_failure(&self, error: &str) {
        if let Some(ctx) = self.context() {
            tracing::debug!(error, "Session failed");
            ctx.session_lost();
        }
    }

    fn on_reconnect(&self, attempt: u32, delay: Duration) {
        if let Some(ctx) = self.context() {
            ctx.post(ReplicationEvent::Reconnecting { attempt, delay });
        }
    }
}
