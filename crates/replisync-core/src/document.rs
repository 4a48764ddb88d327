//! Replicated document model.
//!
//! A [`Document`] is an opaque JSON object identified by a stable id and
//! stamped with the epoch-millisecond time of its last modification.
//! On the wire it is a flat object whose reserved keys are `_id` and
//! `_modified`; every other key is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};

/// Reserved key holding the document id.
pub const DOC_ID: &str = "_id";

/// Reserved key holding the last-modified timestamp.
pub const DOC_MODIFIED: &str = "_modified";

/// A keyed record with a last-modified timestamp.
///
/// Identity is the id alone: two documents with the same id compare equal
/// even if their fields or timestamps differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable document id
    #[serde(rename = "_id")]
    pub id: String,
    /// Last modification time (epoch millis)
    #[serde(rename = "_modified")]
    pub last_modified: i64,
    /// User fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create an empty document with the given id and timestamp.
    #[must_use]
    pub fn new(id: impl Into<String>, last_modified: i64) -> Self {
        Self {
            id: id.into(),
            last_modified,
            fields: Map::new(),
        }
    }

    /// Create an empty document with a random id, modified now.
    #[must_use]
    pub fn create() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), now_millis())
    }

    /// Set a field, returning the document for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    /// Set a field in place. Reserved keys are ignored.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key == DOC_ID || key == DOC_MODIFIED {
            return;
        }
        self.fields.insert(key, value.into());
    }

    /// Get a field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Last modification time (epoch millis).
    #[must_use]
    pub fn last_modified_since_epoch(&self) -> i64 {
        self.last_modified
    }

    /// Bump the modification time to now.
    pub fn touch(&mut self) {
        self.last_modified = now_millis().max(self.last_modified.saturating_add(1));
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Current wall clock time in milliseconds since UNIX epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
