//! # replisync Core
//!
//! Document model, storage interfaces, and the Last-Write-Wins merge engine
//! for replisync.
//!
//! This crate provides:
//! - [`Document`] records keyed by id and stamped with a modification time
//! - The [`DocumentCollection`] and [`TombstoneMap`] storage interfaces, with
//!   in-memory implementations
//! - [`LastWriteWinState`] snapshots exchanged between replicas
//! - [`LastWriteWinMap`], the merge engine with deletion tombstones

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod crdt;
pub mod document;
pub mod error;
pub mod tombstone;

pub use collection::{
    CollectionEvent, CollectionListener, DocumentCollection, EventKind, ListenerSet,
    MemoryCollection, Origin,
};
pub use crdt::{LastWriteWinMap, LastWriteWinState, MergeStats};
pub use document::{now_millis, Document};
pub use error::{StoreError, StoreResult};
pub use tombstone::{MemoryTombstoneMap, TombstoneMap};
