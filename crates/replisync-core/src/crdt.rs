//! Last-Write-Wins map over a document collection and a tombstone map.
//!
//! Conflict rules:
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | Incoming write, no local doc, no tombstone | insert |
//! | Incoming write, no local doc, tombstone newer than the write | drop |
//! | Incoming write, no local doc, tombstone same age or older | insert, clear tombstone |
//! | Incoming write, local doc older | replace |
//! | Incoming write, local doc same age or newer | drop |
//! | Incoming removal, local doc present | delete doc, store the removal time |
//! | Incoming removal, no local doc | ignore |

use crate::collection::{DocumentCollection, Origin};
use crate::document::Document;
use crate::error::StoreResult;
use crate::tombstone::TombstoneMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A state snapshot exchanged between replicas.
///
/// Used both as an inbound merge request and as an outbound
/// "changes since T" response. Never persisted as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastWriteWinState {
    /// Changed documents, unique by id
    #[serde(default)]
    pub changes: Vec<Document>,
    /// Deleted ids -> deletion time
    #[serde(default)]
    pub tombstones: BTreeMap<String, i64>,
}

impl LastWriteWinState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change, replacing any change with the same id.
    pub fn add_change(&mut self, document: Document) {
        if let Some(slot) = self.changes.iter_mut().find(|d| d.id == document.id) {
            *slot = document;
        } else {
            self.changes.push(document);
        }
    }

    /// Add a tombstone.
    pub fn add_tombstone(&mut self, id: impl Into<String>, deleted_at: i64) {
        self.tombstones.insert(id.into(), deleted_at);
    }

    /// Ids of the changed documents.
    #[must_use]
    pub fn change_ids(&self) -> BTreeSet<String> {
        self.changes.iter().map(|d| d.id.clone()).collect()
    }

    /// Ids of the tombstones.
    #[must_use]
    pub fn tombstone_ids(&self) -> BTreeSet<String> {
        self.tombstones.keys().cloned().collect()
    }

    /// Check if the state carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.tombstones.is_empty()
    }
}

/// Counters describing what one [`LastWriteWinMap::merge`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Writes inserted or replaced
    pub applied_puts: usize,
    /// Writes dropped as stale
    pub dropped_puts: usize,
    /// Documents deleted
    pub applied_removes: usize,
    /// Removals ignored because no local document existed
    pub dropped_removes: usize,
}

/// The LWW merge engine bound to one collection and its tombstones.
///
/// Not internally synchronised: callers must serialise `merge` calls on the
/// same collection, since each write is a read-then-write sequence.
#[derive(Clone)]
pub struct LastWriteWinMap {
    collection: Arc<dyn DocumentCollection>,
    tombstones: Arc<dyn TombstoneMap>,
}

impl LastWriteWinMap {
    /// Bind the engine to a collection and tombstone map.
    #[must_use]
    pub fn new(collection: Arc<dyn DocumentCollection>, tombstones: Arc<dyn TombstoneMap>) -> Self {
        Self {
            collection,
            tombstones,
        }
    }

    /// The underlying collection.
    #[must_use]
    pub fn collection(&self) -> &Arc<dyn DocumentCollection> {
        &self.collection
    }

    /// The underlying tombstone map.
    #[must_use]
    pub fn tombstones(&self) -> &Arc<dyn TombstoneMap> {
        &self.tombstones
    }

    /// Merge a remote state: changes first, then tombstones.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; the state may be partially applied
    /// and is safe to merge again.
    pub fn merge(&self, state: &LastWriteWinState) -> StoreResult<MergeStats> {
        let mut stats = MergeStats::default();

        for document in &state.changes {
            if self.apply_put(document)? {
                stats.applied_puts += 1;
            } else {
                stats.dropped_puts += 1;
            }
        }

        for (id, &deleted_at) in &state.tombstones {
            if self.apply_remove(id, deleted_at)? {
                stats.applied_removes += 1;
            } else {
                stats.dropped_removes += 1;
            }
        }

        tracing::debug!(
            collection = self.collection.name(),
            changes = state.changes.len(),
            tombstones = state.tombstones.len(),
            ?stats,
            "Merged state"
        );
        Ok(stats)
    }

    /// Apply one incoming write. Returns `true` if the collection changed.
    fn apply_put(&self, document: &Document) -> StoreResult<bool> {
        match self.collection.get_by_id(&document.id)? {
            None => match self.tombstones.get(&document.id)? {
                Some(deleted_at) if deleted_at > document.last_modified => {
                    tracing::trace!(
                        id = %document.id,
                        deleted_at,
                        modified = document.last_modified,
                        "Dropped write older than tombstone"
                    );
                    Ok(false)
                }
                Some(_) => {
                    self.collection.insert(document.clone(), Origin::Replicator)?;
                    self.tombstones.remove(&document.id)?;
                    Ok(true)
                }
                None => {
                    self.collection.insert(document.clone(), Origin::Replicator)?;
                    Ok(true)
                }
            },
            Some(existing) => {
                if document.last_modified > existing.last_modified {
                    self.collection.remove(&existing, Origin::Replicator)?;
                    self.collection.insert(document.clone(), Origin::Replicator)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Apply one incoming removal. Returns `true` if a document was deleted.
    fn apply_remove(&self, id: &str, deleted_at: i64) -> StoreResult<bool> {
        let Some(existing) = self.collection.get_by_id(id)? else {
            tracing::trace!(id, deleted_at, "Ignored removal of unknown document");
            return Ok(false);
        };
        self.collection.remove(&existing, Origin::Replicator)?;
        self.tombstones.put(id, deleted_at)?;
        Ok(true)
    }

    /// Record a deletion, keeping the later time if one already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the tombstone map fails.
    pub fn record_tombstone(&self, id: &str, deleted_at: i64) -> StoreResult<()> {
        match self.tombstones.get(id)? {
            Some(current) if current >= deleted_at => Ok(()),
            _ => self.tombstones.put(id, deleted_at),
        }
    }

    /// Changes with `last_modified >= since`, one page at a time.
    ///
    /// Tombstones with `deleted_at >= since` are attached to the first page
    /// (`offset == 0`) only.
    ///
    /// # Errors
    ///
    /// Returns error if the collection or tombstone map fails.
    pub fn get_changes_since(
        &self,
        since: i64,
        offset: usize,
        size: usize,
    ) -> StoreResult<LastWriteWinState> {
        let mut state = LastWriteWinState::new();
        for document in self.collection.find_modified_since(since, offset, size)? {
            state.add_change(document);
        }

        if offset == 0 {
            for (id, deleted_at) in self.tombstones.entries()? {
                if deleted_at >= since {
                    state.tombstones.insert(id, deleted_at);
                }
            }
        }

        Ok(state)
    }

    /// Current local document.
    ///
    /// # Errors
    ///
    /// Returns error if the collection fails.
    pub fn document(&self, id: &str) -> StoreResult<Option<Document>> {
        self.collection.get_by_id(id)
    }

    /// Current tombstone time.
    ///
    /// # Errors
    ///
    /// Returns error if the tombstone map fails.
    pub fn tombstone(&self, id: &str) -> StoreResult<Option<i64>> {
        self.tombstones.get(id)
    }

    /// Drop tombstones deleted before `before`. Returns the dropped ids.
    ///
    /// # Errors
    ///
    /// Returns error if the tombstone map fails.
    pub fn collect_garbage(&self, before: i64) -> StoreResult<Vec<String>> {
        let expired: Vec<String> = self
            .tombstones
            .entries()?
            .into_iter()
            .filter(|(_, deleted_at)| *deleted_at < before)
            .map(|(id, _)| id)
            .collect();

        for id in &expired {
            self.tombstones.remove(id)?;
        }

        if !expired.is_empty() {
            tracing::info!(
                collection = self.collection.name(),
                removed = expired.len(),
                before,
                "Collected expired tombstones"
            );
        }
        Ok(expired)
    }
}

impl std::fmt::Debug for LastWriteWinMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastWriteWinMap")
            .field("collection", &self.collection.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::MemoryCollection;
    use crate::tombstone::MemoryTombstoneMap;

    struct Fixture {
        collection: Arc<MemoryCollection>,
        tombstones: Arc<MemoryTombstoneMap>,
        crdt: LastWriteWinMap,
    }

    fn fixture() -> Fixture {
        let collection = Arc::new(MemoryCollection::new("test"));
        let tombstones = Arc::new(MemoryTombstoneMap::new());
        let crdt = LastWriteWinMap::new(collection.clone(), tombstones.clone());
        Fixture {
            collection,
            tombstones,
            crdt,
        }
    }

    fn state(changes: Vec<Document>, tombstones: &[(&str, i64)]) -> LastWriteWinState {
        let mut state = LastWriteWinState::new();
        for doc in changes {
            state.add_change(doc);
        }
        for (id, ts) in tombstones {
            state.add_tombstone(*id, *ts);
        }
        state
    }

    fn contents(f: &Fixture) -> (Vec<(String, i64, serde_json::Value)>, Vec<(String, i64)>) {
        let docs = f
            .collection
            .snapshot()
            .into_iter()
            .map(|d| {
                let v = d.get("v").cloned().unwrap_or_default();
                (d.id, d.last_modified, v)
            })
            .collect();
        (docs, f.tombstones.entries().unwrap())
    }

    #[test]
    fn tombstone_precedence() {
        let f = fixture();
        f.collection
            .insert(Document::new("1", 100), Origin::Local)
            .unwrap();

        f.crdt.merge(&state(vec![], &[("1", 150)])).unwrap();
        assert!(f.crdt.document("1").unwrap().is_none());
        assert_eq!(f.crdt.tombstone("1").unwrap(), Some(150));

        // Stale write older than the deletion is dropped
        f.crdt
            .merge(&state(vec![Document::new("1", 140)], &[]))
            .unwrap();
        assert!(f.crdt.document("1").unwrap().is_none());

        // Newer write resurrects and clears the tombstone
        f.crdt
            .merge(&state(vec![Document::new("1", 200)], &[]))
            .unwrap();
        assert_eq!(f.crdt.document("1").unwrap().unwrap().last_modified, 200);
        assert_eq!(f.crdt.tombstone("1").unwrap(), None);
    }

    #[test]
    fn write_wins_tie_with_tombstone() {
        let f = fixture();
        f.tombstones.put("t", 100).unwrap();
        let stats = f
            .crdt
            .merge(&state(vec![Document::new("t", 100)], &[]))
            .unwrap();
        assert_eq!(stats.applied_puts, 1);
        assert_eq!(f.crdt.document("t").unwrap().unwrap().last_modified, 100);
        assert_eq!(f.crdt.tombstone("t").unwrap(), None);

        // A strictly newer tombstone still suppresses the write
        let g = fixture();
        g.tombstones.put("t", 101).unwrap();
        g.crdt
            .merge(&state(vec![Document::new("t", 100)], &[]))
            .unwrap();
        assert!(g.crdt.document("t").unwrap().is_none());
        assert_eq!(g.crdt.tombstone("t").unwrap(), Some(101));
    }

    #[test]
    fn newer_write_replaces_older() {
        let f = fixture();
        f.collection
            .insert(Document::new("a", 10).with("v", "old"), Origin::Local)
            .unwrap();

        let stats = f
            .crdt
            .merge(&state(vec![Document::new("a", 20).with("v", "new")], &[]))
            .unwrap();
        assert_eq!(stats.applied_puts, 1);
        assert_eq!(f.crdt.document("a").unwrap().unwrap().get("v").unwrap(), "new");

        let stats = f
            .crdt
            .merge(&state(vec![Document::new("a", 20).with("v", "same-age")], &[]))
            .unwrap();
        assert_eq!(stats.dropped_puts, 1);
        assert_eq!(f.crdt.document("a").unwrap().unwrap().get("v").unwrap(), "new");
    }

    #[test]
    fn removal_deletes_present_document_regardless_of_age() {
        let f = fixture();
        f.collection
            .insert(Document::new("a", 300), Origin::Local)
            .unwrap();

        // Removal stamped before the document's own time still deletes it
        let stats = f.crdt.merge(&state(vec![], &[("a", 250)])).unwrap();
        assert_eq!(stats.applied_removes, 1);
        assert!(f.crdt.document("a").unwrap().is_none());
        assert_eq!(f.crdt.tombstone("a").unwrap(), Some(250));
    }

    #[test]
    fn removal_of_absent_document_is_ignored() {
        let f = fixture();
        let stats = f.crdt.merge(&state(vec![], &[("x", 5)])).unwrap();
        assert_eq!(stats.dropped_removes, 1);
        assert_eq!(stats.applied_removes, 0);
        assert_eq!(f.crdt.tombstone("x").unwrap(), None);
        assert!(f.tombstones.entries().unwrap().is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let f = fixture();
        f.collection
            .insert(Document::new("keep", 50), Origin::Local)
            .unwrap();
        f.collection
            .insert(Document::new("gone", 50), Origin::Local)
            .unwrap();

        let s = state(
            vec![
                Document::new("keep", 60).with("v", 1),
                Document::new("new", 70).with("v", 2),
            ],
            &[("gone", 80), ("never-seen", 90)],
        );

        f.crdt.merge(&s).unwrap();
        let once = contents(&f);
        let stats = f.crdt.merge(&s).unwrap();
        let twice = contents(&f);

        assert_eq!(once, twice);
        assert_eq!(stats.applied_puts, 0);
        assert_eq!(stats.applied_removes, 0);
    }

    #[test]
    fn merge_order_converges() {
        let a = state(vec![Document::new("x", 100).with("v", "a")], &[("z", 300)]);
        let b = state(vec![Document::new("x", 200).with("v", "b")], &[("y", 20)]);

        let seeded = || {
            let f = fixture();
            f.collection
                .insert(Document::new("y", 10), Origin::Local)
                .unwrap();
            f.collection
                .insert(Document::new("z", 250), Origin::Local)
                .unwrap();
            f
        };

        let left = seeded();
        left.crdt.merge(&a).unwrap();
        left.crdt.merge(&b).unwrap();

        let right = seeded();
        right.crdt.merge(&b).unwrap();
        right.crdt.merge(&a).unwrap();

        assert_eq!(contents(&left), contents(&right));
        assert_eq!(left.crdt.document("x").unwrap().unwrap().get("v").unwrap(), "b");
        assert!(left.crdt.document("y").unwrap().is_none());
        assert!(left.crdt.document("z").unwrap().is_none());
        assert_eq!(left.crdt.tombstone("y").unwrap(), Some(20));
        assert_eq!(left.crdt.tombstone("z").unwrap(), Some(300));
    }

    #[test]
    fn pagination_is_complete_and_tombstones_come_once() {
        let f = fixture();
        for i in 0..23_i64 {
            f.collection
                .insert(Document::new(format!("doc-{i:02}"), 1000 + i % 5), Origin::Local)
                .unwrap();
        }
        f.collection
            .insert(Document::new("too-old", 10), Origin::Local)
            .unwrap();
        f.tombstones.put("dead-new", 1500).unwrap();
        f.tombstones.put("dead-old", 5).unwrap();

        let page = 4;
        let mut offset = 0;
        let mut seen = Vec::new();
        loop {
            let chunk = f.crdt.get_changes_since(1000, offset, page).unwrap();
            if offset == 0 {
                assert_eq!(chunk.tombstone_ids(), BTreeSet::from(["dead-new".to_string()]));
            } else {
                assert!(chunk.tombstones.is_empty());
            }
            if chunk.changes.is_empty() {
                break;
            }
            seen.extend(chunk.changes.into_iter().map(|d| d.id));
            offset += page;
        }

        let unique: BTreeSet<String> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), 23);
        assert_eq!(unique.len(), 23);
        assert!(!unique.contains("too-old"));
    }

    #[test]
    fn collect_garbage_drops_only_expired() {
        let f = fixture();
        f.tombstones.put("old", 10).unwrap();
        f.tombstones.put("fresh", 100).unwrap();

        let removed = f.crdt.collect_garbage(50).unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(f.crdt.tombstone("fresh").unwrap(), Some(100));
    }

    #[test]
    fn replicated_writes_are_tagged() {
        use crate::collection::{CollectionEvent, CollectionListener};
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Origins(Mutex<Vec<Origin>>);
        impl CollectionListener for Origins {
            fn on_event(&self, event: &CollectionEvent) {
                self.0.lock().push(event.origin);
            }
        }

        let f = fixture();
        let origins = Arc::new(Origins::default());
        f.collection.subscribe(origins.clone());

        f.crdt
            .merge(&state(vec![Document::new("r", 1)], &[("r", 2)]))
            .unwrap();

        let seen = origins.0.lock().clone();
        assert_eq!(seen, vec![Origin::Replicator, Origin::Replicator]);
    }
}
