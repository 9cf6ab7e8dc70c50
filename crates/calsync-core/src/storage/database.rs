//! SQLite-backed blob storage for the event store and action queue.
//!
//! Each store persists as a single JSON document under its own key in the
//! `kv` table, so a damaged blob only ever affects the store that owns it.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{data_dir, migrations};
use crate::error::{Result, StorageError};

/// Database handle shared by the event store and the action queue.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Outcome of reading a persisted blob.
#[derive(Debug)]
pub enum BlobLoad<T> {
    /// Nothing stored under the key yet.
    Missing,
    Loaded(T),
    /// The blob did not parse and was moved aside.
    Corrupt {
        quarantined_as: String,
        message: String,
    },
}

/// SQLite database holding the persisted sync state.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open the database at `~/.config/calsync/calsync.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        let path = data_dir()?.join("calsync.db");
        Self::open_at(&path)
    }

    /// Open (or create) a database file at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|source| StorageError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Wrap into the shared handle used by the stores.
    pub fn shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        migrations::migrate(&self.conn)
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Keys currently present, in lexical order.
    pub fn kv_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Read and decode the blob stored under `key`.
    ///
    /// A blob that fails to decode is copied to `<key>.corrupt.<unix-ts>` and
    /// removed from `key`; no other key is touched.
    pub fn load_blob<T: DeserializeOwned>(&self, key: &str) -> Result<BlobLoad<T>, StorageError> {
        let Some(raw) = self.kv_get(key)? else {
            return Ok(BlobLoad::Missing);
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Ok(BlobLoad::Loaded(value)),
            Err(e) => {
                let quarantined_as = format!("{key}.corrupt.{}", Utc::now().timestamp_millis());
                let tx = self.conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                    params![quarantined_as, raw],
                )?;
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                tx.commit()?;
                Ok(BlobLoad::Corrupt {
                    quarantined_as,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Encode and store `value` under `key`.
    pub fn save_blob<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::Encode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.kv_set(key, &raw)
    }
}
