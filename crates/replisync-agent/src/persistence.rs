//! `SQLite` persistence layer.
//!
//! One database file can hold many collections; every table is keyed by
//! collection name and each [`SqliteStore`] is bound to one of them.

use parking_lot::Mutex;
use replisync_core::{
    CollectionListener, Document, DocumentCollection, EventKind, ListenerSet, Origin, StoreError,
    StoreResult, TombstoneMap,
};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// `SQLite`-backed collection, tombstone map, and attribute store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    collection: String,
    persistent: bool,
    listeners: ListenerSet,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path, collection: impl Into<String>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::with_connection(conn, collection.into(), true)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory(collection: impl Into<String>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn, collection.into(), false)
    }

    fn with_connection(
        conn: Connection,
        collection: String,
        persistent: bool,
    ) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            collection,
            persistent,
            listeners: ListenerSet::new(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .lock()
            .execute_batch(
                r"
                -- Current document bodies
                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    last_modified INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );

                CREATE INDEX IF NOT EXISTS idx_documents_modified
                    ON documents(collection, last_modified, id);

                -- Deletion markers
                CREATE TABLE IF NOT EXISTS tombstones (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    deleted_at INTEGER NOT NULL,
                    PRIMARY KEY (collection, id)
                );

                -- Replica metadata (checkpoint, replica id)
                CREATE TABLE IF NOT EXISTS attributes (
                    collection TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (collection, key)
                );
                ",
            )
            .map_err(backend)
    }

    /// Names of every collection with stored documents, tombstones, or
    /// attributes.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn collections(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r"
                SELECT collection FROM documents
                UNION SELECT collection FROM tombstones
                UNION SELECT collection FROM attributes
                ORDER BY 1
                ",
            )
            .map_err(backend)?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(backend)?;
        Ok(names)
    }

    fn write_document(&self, document: &Document, replace: bool) -> StoreResult<bool> {
        let body = serde_json::to_string(document)?;
        let conn = self.conn.lock();
        let existed = conn
            .query_row(
                "SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2",
                (&self.collection, &document.id),
                |_| Ok(()),
            )
            .optional()
            .map_err(backend)?
            .is_some();

        if existed && !replace {
            return Err(StoreError::Duplicate(document.id.clone()));
        }

        conn.execute(
            r"
            INSERT OR REPLACE INTO documents (collection, id, last_modified, body)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (&self.collection, &document.id, document.last_modified, body),
        )
        .map_err(backend)?;
        Ok(existed)
    }
}

impl DocumentCollection for SqliteStore {
    fn name(&self) -> &str {
        &self.collection
    }

    fn get_by_id(&self, id: &str) -> StoreResult<Option<Document>> {
        let body: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                (&self.collection, id),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        body.map(|body| serde_json::from_str(&body).map_err(StoreError::from))
            .transpose()
    }

    fn insert(&self, document: Document, origin: Origin) -> StoreResult<()> {
        self.write_document(&document, false)?;
        self.listeners.notify(EventKind::Insert, document, origin);
        Ok(())
    }

    fn update(&self, document: Document, origin: Origin) -> StoreResult<()> {
        let existed = self.write_document(&document, true)?;
        let kind = if existed {
            EventKind::Update
        } else {
            EventKind::Insert
        };
        self.listeners.notify(kind, document, origin);
        Ok(())
    }

    fn remove(&self, document: &Document, origin: Origin) -> StoreResult<bool> {
        let Some(stored) = self.get_by_id(&document.id)? else {
            return Ok(false);
        };
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                (&self.collection, &document.id),
            )
            .map_err(backend)?;
        if deleted == 0 {
            return Ok(false);
        }
        self.listeners.notify(EventKind::Remove, stored, origin);
        Ok(true)
    }

    fn find_modified_since(
        &self,
        since: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                r"
                SELECT body FROM documents
                WHERE collection = ?1 AND last_modified >= ?2
                ORDER BY last_modified ASC, id ASC
                LIMIT ?3 OFFSET ?4
                ",
            )
            .map_err(backend)?;
        let bodies = stmt
            .query_map(
                (&self.collection, since, to_i64(limit), to_i64(offset)),
                |row| row.get::<_, String>(0),
            )
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(backend)?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    fn len(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                [&self.collection],
                |row| row.get(0),
            )
            .map_err(backend)?;
        usize::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn attribute(&self, key: &str) -> StoreResult<Option<String>> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM attributes WHERE collection = ?1 AND key = ?2",
                (&self.collection, key),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn set_attribute(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO attributes (collection, key, value) VALUES (?1, ?2, ?3)",
                (&self.collection, key, value),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn CollectionListener>) {
        self.listeners.add(listener);
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}

impl TombstoneMap for SqliteStore {
    fn get(&self, id: &str) -> StoreResult<Option<i64>> {
        self.conn
            .lock()
            .query_row(
                "SELECT deleted_at FROM tombstones WHERE collection = ?1 AND id = ?2",
                (&self.collection, id),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn put(&self, id: &str, deleted_at: i64) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO tombstones (collection, id, deleted_at) VALUES (?1, ?2, ?3)",
                (&self.collection, id, deleted_at),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<Option<i64>> {
        let previous = TombstoneMap::get(self, id)?;
        if previous.is_some() {
            self.conn
                .lock()
                .execute(
                    "DELETE FROM tombstones WHERE collection = ?1 AND id = ?2",
                    (&self.collection, id),
                )
                .map_err(backend)?;
        }
        Ok(previous)
    }

    fn entries(&self) -> StoreResult<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, deleted_at FROM tombstones WHERE collection = ?1 ORDER BY id")
            .map_err(backend)?;
        let entries = stmt
            .query_map([&self.collection], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()
            .map_err(backend)?;
        Ok(entries)
    }

    fn len(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM tombstones WHERE collection = ?1",
                [&self.collection],
                |row| row.get(0),
            )
            .map_err(backend)?;
        usize::try_from(count).map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
