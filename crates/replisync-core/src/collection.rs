//! Document collection interface and change events.
//!
//! The merge engine only needs point lookups, inserts, removals, and a
//! range scan by modification time. Writes are tagged with an [`Origin`] so
//! listeners can tell local edits apart from replicated ones.

use crate::document::{now_millis, Document};
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Who performed a collection write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A local application write
    Local,
    /// A write applied by the replicator while merging remote state
    Replicator,
}

/// Kind of collection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A new document was inserted
    Insert,
    /// An existing document was replaced
    Update,
    /// A document was removed
    Remove,
}

/// A change notification emitted by a collection.
#[derive(Debug, Clone)]
pub struct CollectionEvent {
    /// What happened
    pub kind: EventKind,
    /// The document after the change (or the removed document)
    pub document: Document,
    /// Who made the change
    pub origin: Origin,
    /// When the change happened (epoch millis)
    pub timestamp: i64,
}

/// Receives collection change notifications.
///
/// Called synchronously on the writer's thread after the write is visible.
pub trait CollectionListener: Send + Sync {
    /// Handle one change.
    fn on_event(&self, event: &CollectionEvent);
}

/// A keyed document store.
pub trait DocumentCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Look up a document by id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn get_by_id(&self, id: &str) -> StoreResult<Option<Document>>;

    /// Insert a new document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the id exists, or a backend error.
    fn insert(&self, document: Document, origin: Origin) -> StoreResult<()>;

    /// Replace a document, inserting it if absent.
    ///
    /// # Errors
    ///
    /// Returns error if the backend write fails.
    fn update(&self, document: Document, origin: Origin) -> StoreResult<()>;

    /// Remove a document. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the backend write fails.
    fn remove(&self, document: &Document, origin: Origin) -> StoreResult<bool>;

    /// Documents with `last_modified >= since`, ordered by
    /// `(last_modified, id)` ascending, paged by `offset`/`limit`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn find_modified_since(
        &self,
        since: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Document>>;

    /// Number of documents.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn len(&self) -> StoreResult<usize>;

    /// Check if the collection is empty.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read a metadata attribute.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn attribute(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a metadata attribute.
    ///
    /// # Errors
    ///
    /// Returns error if the backend write fails.
    fn set_attribute(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Register a change listener.
    fn subscribe(&self, listener: Arc<dyn CollectionListener>);

    /// Check if documents outlive the process.
    fn is_persistent(&self) -> bool {
        false
    }
}

/// A set of registered listeners, shared by collection backends.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn CollectionListener>>>,
}

impl ListenerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn add(&self, listener: Arc<dyn CollectionListener>) {
        self.listeners.write().push(listener);
    }

    /// Notify every listener. Must be called without holding backend locks.
    pub fn notify(&self, kind: EventKind, document: Document, origin: Origin) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let event = CollectionEvent {
            kind,
            document,
            origin,
            timestamp: now_millis(),
        };
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.read().len())
            .finish()
    }
}

/// In-memory [`DocumentCollection`].
#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    documents: RwLock<HashMap<String, Document>>,
    attributes: RwLock<HashMap<String, String>>,
    listeners: ListenerSet,
}

impl MemoryCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: RwLock::new(HashMap::new()),
            attributes: RwLock::new(HashMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    /// Snapshot of all documents sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.documents.read().values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }
}

impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_by_id(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.documents.read().get(id).cloned())
    }

    fn insert(&self, document: Document, origin: Origin) -> StoreResult<()> {
        {
            let mut documents = self.documents.write();
            if documents.contains_key(&document.id) {
                return Err(StoreError::Duplicate(document.id));
            }
            documents.insert(document.id.clone(), document.clone());
        }
        self.listeners.notify(EventKind::Insert, document, origin);
        Ok(())
    }

    fn update(&self, document: Document, origin: Origin) -> StoreResult<()> {
        let existed = self
            .documents
            .write()
            .insert(document.id.clone(), document.clone())
            .is_some();
        let kind = if existed {
            EventKind::Update
        } else {
            EventKind::Insert
        };
        self.listeners.notify(kind, document, origin);
        Ok(())
    }

    fn remove(&self, document: &Document, origin: Origin) -> StoreResult<bool> {
        let removed = self.documents.write().remove(&document.id);
        match removed {
            Some(doc) => {
                self.listeners.notify(EventKind::Remove, doc, origin);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_modified_since(
        &self,
        since: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let mut matching: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|doc| doc.last_modified >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.documents.read().len())
    }

    fn attribute(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.attributes.read().get(key).cloned())
    }

    fn set_attribute(&self, key: &str, value: &str) -> StoreResult<()> {
        self.attributes
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn CollectionListener>) {
        self.listeners.add(listener);
    }
}
