//! Storage error type shared by collection and tombstone backends.

/// Errors raised by a [`DocumentCollection`](crate::DocumentCollection) or
/// [`TombstoneMap`](crate::TombstoneMap) backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend failed to read or write
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A stored value could not be encoded or decoded
    #[error("storage encoding error: {0}")]
    Encoding(String),
    /// A document with this id already exists
    #[error("duplicate document id: {0}")]
    Duplicate(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
