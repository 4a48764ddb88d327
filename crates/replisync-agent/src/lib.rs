//! # replisync Agent
//!
//! Replica runtime: keeps one local collection in sync with a remote
//! endpoint over a persistent WebSocket.
//!
//! ## Architecture
//!
//! A [`Replica`] runs three concurrent parts:
//! 1. **Transport**: [`ReplicaSocket`] connects, heartbeats, and reconnects
//!    with linear capped backoff
//! 2. **Batches**: the scheduler streams local changes newer than the
//!    checkpoint as start/continue/end pages
//! 3. **Feeds**: local writes are published as standalone feeds while the
//!    session is up
//!
//! Inbound messages go through [`MessageDispatcher`] to the protocol
//! [`handlers`], which merge under the [`ReplicationContext`]'s lock and
//! acknowledge with receipts. The [`FeedJournal`] tracks unacknowledged ids
//! so they can be resent from current state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handlers;
pub mod journal;
pub mod listener;
pub mod persistence;
pub mod replica;
pub mod scheduler;
pub mod socket;

pub use config::{
    AgentConfig, Authentication, ConnectivityChecker, FrameEncoding, ProxyConfig, ReplicaConfig,
    SocketConfig,
};
pub use context::{Checkpoint, MessageSender, ReplicationContext};
pub use dispatcher::MessageDispatcher;
pub use error::{ReplicationError, TransportError};
pub use event::ReplicationEvent;
pub use journal::FeedJournal;
pub use listener::ReplicaChangeListener;
pub use persistence::SqliteStore;
pub use replica::{Replica, ReplicaBuilder};
pub use scheduler::BatchOutcome;
pub use socket::{backoff_delay, ReplicaSocket, SocketListener, Status};
