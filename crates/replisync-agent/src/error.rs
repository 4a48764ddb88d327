//! Error types for the replica runtime.
//!
//! Errors are either fatal (the session cannot be established at all) or
//! recoverable (a transient failure the reconnect path deals with).

use replisync_core::StoreError;
use replisync_proto::MessageError;
use std::time::Duration;

/// Errors raised by the [`ReplicaSocket`](crate::ReplicaSocket).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The endpoint URL is malformed or not `ws`/`wss`
    #[error("invalid endpoint: {0}")]
    InvalidUrl(String),
    /// Credentials cannot be sent as a header
    #[error("invalid authorization header: {0}")]
    InvalidHeader(String),
    /// TLS could not be configured
    #[error("TLS setup failed: {0}")]
    Tls(String),
    /// The connection attempt failed
    #[error("connect failed: {0}")]
    Connect(String),
    /// The handshake did not finish in time
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// No live connection
    #[error("not connected")]
    NotConnected,
    /// The outbound queue is full
    #[error("outbound queue is full")]
    Backpressure,
    /// The frame could not be handed to the connection
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The message could not be encoded
    #[error(transparent)]
    Encode(#[from] MessageError),
}

impl TransportError {
    /// Check if retrying cannot help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_) | Self::InvalidHeader(_) | Self::Tls(_)
        )
    }
}

/// Errors raised while replicating a collection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// The replica is misconfigured
    #[error("configuration error: {0}")]
    Config(String),
    /// The collection or tombstone store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A message could not be encoded or decoded
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// The transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The remote side reported an error
    #[error("remote error: {message}")]
    Remote {
        /// Error text sent by the remote
        message: String,
        /// Whether the remote asked to stop
        fatal: bool,
    },
}

impl ReplicationError {
    /// Check if replication must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Transport(err) => err.is_fatal(),
            Self::Remote { fatal, .. } => *fatal,
            Self::Store(_) | Self::Message(_) => false,
        }
    }
}
