//! Tombstone map interface: document id -> deletion timestamp.

use crate::error::StoreResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A persistent ordered map from document id to deletion time (epoch millis).
pub trait TombstoneMap: Send + Sync {
    /// Deletion time for an id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn get(&self, id: &str) -> StoreResult<Option<i64>>;

    /// Record or overwrite a deletion time.
    ///
    /// # Errors
    ///
    /// Returns error if the backend write fails.
    fn put(&self, id: &str, deleted_at: i64) -> StoreResult<()>;

    /// Drop a tombstone. Returns the previous deletion time.
    ///
    /// # Errors
    ///
    /// Returns error if the backend write fails.
    fn remove(&self, id: &str) -> StoreResult<Option<i64>>;

    /// All tombstones ordered by id.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn entries(&self) -> StoreResult<Vec<(String, i64)>>;

    /// Number of tombstones.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn len(&self) -> StoreResult<usize> {
        Ok(self.entries()?.len())
    }

    /// Check if there are no tombstones.
    ///
    /// # Errors
    ///
    /// Returns error if the backend read fails.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory [`TombstoneMap`].
#[derive(Debug, Default)]
pub struct MemoryTombstoneMap {
    entries: RwLock<BTreeMap<String, i64>>,
}

impl MemoryTombstoneMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TombstoneMap for MemoryTombstoneMap {
    fn get(&self, id: &str) -> StoreResult<Option<i64>> {
        Ok(self.entries.read().get(id).copied())
    }

    fn put(&self, id: &str, deleted_at: i64) -> StoreResult<()> {
        self.entries.write().insert(id.to_string(), deleted_at);
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<Option<i64>> {
        Ok(self.entries.write().remove(id))
    }

    fn entries(&self) -> StoreResult<Vec<(String, i64)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(id, ts)| (id.clone(), *ts))
            .collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.read().len())
    }
}
