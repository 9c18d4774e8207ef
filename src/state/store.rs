use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors raised by a durable key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare storage directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not determine user data directory")]
    NoDataDir,
    #[error("store lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Durable blob storage the result cache persists through
pub trait KeyValueStore: Send + Sync {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// SQLite-backed key-value store.
///
/// The database file is created in the user's data directory by default:
/// - Linux: ~/.local/share/blur-scan/blur_scan.db
/// - macOS: ~/Library/Application Support/blur-scan/blur_scan.db
/// - Windows: %APPDATA%\blur-scan\blur_scan.db
pub struct SqliteStore {
    // rusqlite::Connection is Send but not Sync
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open the store at the default location
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(&Self::default_db_path()?)
    }

    /// Open or create the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        tracing::debug!(path = %db_path.display(), "opened key-value store");

        let store = SqliteStore {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Get the path where the database is stored by default
    pub fn default_db_path() -> Result<PathBuf, StoreError> {
        let mut path = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or(StoreError::NoDataDir)?;

        path.push("blur-scan");
        path.push("blur_scan.db");
        Ok(path)
    }

    /// Create the blob table if it doesn't exist
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key             TEXT PRIMARY KEY,
                value           BLOB NOT NULL,
                updated_at      INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Get the path to the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl KeyValueStore for SqliteStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, bytes, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

/// Volatile store, for tests and `check` runs that never persist
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.lock()?.get(key).cloned())
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        assert!(store.read_blob("k").unwrap().is_none());

        store.write_blob("k", b"one").unwrap();
        store.write_blob("k", b"two").unwrap();
        assert_eq!(store.read_blob("k").unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("cache.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            assert!(store.read_blob("results").unwrap().is_none());
            store.write_blob("results", b"first").unwrap();
            store.write_blob("results", b"second").unwrap();
        }

        let reopened = SqliteStore::open(&db_path).unwrap();
        assert_eq!(reopened.path(), db_path.as_path());
        assert_eq!(
            reopened.read_blob("results").unwrap().as_deref(),
            Some(&b"second"[..])
        );
    }
}
