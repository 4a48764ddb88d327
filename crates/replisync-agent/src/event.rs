//! Replication lifecycle events.

use std::time::Duration;

/// Something that happened to a replica's replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// Replication was started
    Started,
    /// The handshake with the remote completed
    Connected,
    /// Replication was stopped
    Stopped,
    /// A reconnect attempt was scheduled
    Reconnecting {
        /// Consecutive failed attempts so far
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// An error was reported
    Error {
        /// Error text
        message: String,
        /// Whether replication stopped because of it
        fatal: bool,
    },
}
