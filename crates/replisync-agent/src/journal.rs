//! Feed journal: which sent ids are still waiting for a receipt.
//!
//! Entries are keyed by correlation id (the batch id for scheduled batches,
//! the feed's own id for standalone feeds). Each entry holds the ids sent
//! under that key that no receipt has covered yet.

use parking_lot::Mutex;
use replisync_core::LastWriteWinState;
use replisync_proto::Receipt;
use std::collections::HashMap;

/// Tracks outstanding ids per batch.
#[derive(Debug, Default)]
pub struct FeedJournal {
    entries: Mutex<HashMap<String, Receipt>>,
}

impl FeedJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ids of a sent state as pending under `key`.
    pub fn write(&self, key: &str, state: &LastWriteWinState) {
        let sent = Receipt::from_state(state);
        if sent.is_empty() {
            return;
        }
        self.entries
            .lock()
            .entry(key.to_string())
            .or_default()
            .union(&sent);
    }

    /// Clear the ids a receipt covers. Returns `false` for an unknown key.
    pub fn acknowledge(&self, key: &str, receipt: &Receipt) -> bool {
        let mut entries = self.entries.lock();
        let Some(pending) = entries.get_mut(key) else {
            return false;
        };
        pending.subtract(receipt);
        if pending.is_empty() {
            entries.remove(key);
        }
        true
    }

    /// Every open key and the union of the ids still pending under them.
    ///
    /// Entries stay open until [`retire`](Self::retire) is called.
    #[must_use]
    pub fn outstanding(&self) -> (Vec<String>, Receipt) {
        let entries = self.entries.lock();
        let mut outstanding = Receipt::default();
        for pending in entries.values() {
            outstanding.union(pending);
        }
        (entries.keys().cloned().collect(), outstanding)
    }

    /// Close the given entries.
    pub fn retire(&self, keys: &[String]) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
    }

    /// Stop tracking ids whose tombstones were collected.
    pub fn forget_removed(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let forgotten = Receipt {
            removed: ids.iter().cloned().collect(),
            ..Receipt::default()
        };
        self.entries.lock().retain(|_, pending| {
            pending.subtract(&forgotten);
            !pending.is_empty()
        });
    }

    /// Pending ids under `key`.
    #[must_use]
    pub fn pending(&self, key: &str) -> Option<Receipt> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of open entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replisync_core::Document;
    use std::collections::BTreeSet;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    fn page(changes: &[&str], tombstones: &[&str]) -> LastWriteWinState {
        let mut state = LastWriteWinState::new();
        for id in changes {
            state.add_change(Document::new(*id, 1));
        }
        for id in tombstones {
            state.add_tombstone(*id, 1);
        }
        state
    }

    #[test]
    fn acknowledged_ids_leave_the_final_receipt() {
        let journal = FeedJournal::new();
        journal.write("batch", &page(&["a", "b"], &["x"]));
        journal.write("batch", &page(&["c"], &[]));

        assert!(journal.acknowledge("batch", &Receipt::new(ids(&["a", "c"]), ids(&["x"]))));

        let last = journal.pending("batch").unwrap();
        assert_eq!(last.added, ids(&["b"]));
        assert!(last.removed.is_empty());

        journal.retire(&["batch".to_string()]);
        assert!(journal.pending("batch").is_none());
    }

    #[test]
    fn fully_acknowledged_entries_retire() {
        let journal = FeedJournal::new();
        journal.write("feed-1", &page(&["a"], &[]));
        journal.acknowledge("feed-1", &Receipt::new(ids(&["a"]), BTreeSet::new()));

        assert!(journal.is_empty());
        assert!(!journal.acknowledge("feed-1", &Receipt::default()));
    }

    #[test]
    fn empty_pages_are_not_tracked() {
        let journal = FeedJournal::new();
        journal.write("batch", &LastWriteWinState::new());
        assert!(journal.is_empty());
    }

    #[test]
    fn outstanding_spans_entries_until_retired() {
        let journal = FeedJournal::new();
        journal.write("b1", &page(&["a"], &[]));
        journal.write("f1", &page(&[], &["z"]));

        let (mut keys, all) = journal.outstanding();
        keys.sort();
        assert_eq!(keys, vec!["b1".to_string(), "f1".to_string()]);
        assert_eq!(all.added, ids(&["a"]));
        assert_eq!(all.removed, ids(&["z"]));
        assert_eq!(journal.len(), 2);

        journal.write("f2", &page(&["late"], &[]));
        journal.retire(&keys);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.pending("f2").unwrap().added, ids(&["late"]));
    }

    #[test]
    fn forget_removed_drops_collected_tombstones() {
        let journal = FeedJournal::new();
        journal.write("b1", &page(&["a"], &["gone"]));
        journal.write("b2", &page(&[], &["gone"]));

        journal.forget_removed(&["gone".to_string()]);

        assert_eq!(journal.len(), 1);
        assert_eq!(journal.pending("b1").unwrap().added, ids(&["a"]));
    }
}
