//! SQLite-backed key-value storage for daily step records.
//!
//! Provides persistent storage for:
//! - One `daily_steps_YYYY-MM-DD` value per calendar day
//! - Range lookups over finalized days (history)

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection};

use super::{data_dir, day_key, parse_total, KeyValueStore};
use crate::error::StorageError;
use crate::tracker::DailyStepRecord;

/// SQLite database holding the `kv` table.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `~/.config/stepgarden/stepgarden.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, StorageError> {
        let dir = data_dir().map_err(|e| StorageError::Open {
            path: "~/.config/stepgarden".into(),
            message: e.to_string(),
        })?;
        Self::open_at(&dir.join("stepgarden.db"))
    }

    /// Open (or create) the database file at `path`.
    pub fn open_at(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::with_connection(conn, path)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Open {
            path: ":memory:".into(),
            message: e.to_string(),
        })?;
        Self::with_connection(conn, Path::new(":memory:"))
    }

    fn with_connection(conn: Connection, path: &Path) -> Result<Self, StorageError> {
        migrate(&conn).map_err(|e| StorageError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let result = stmt.query_row(params![key], |row| row.get::<_, String>(0));
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Stored daily records for `from..=to`, oldest first.
    ///
    /// Values that do not parse as a step total are skipped.
    pub fn history(
        &self,
        prefix: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStepRecord>, StorageError> {
        let conn = self.conn();
        let read_err = |e: rusqlite::Error| StorageError::Read {
            key: format!("{prefix}*"),
            message: e.to_string(),
        };

        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE key >= ?1 AND key <= ?2
                 ORDER BY key",
            )
            .map_err(read_err)?;
        let rows = stmt
            .query_map(params![day_key(prefix, from), day_key(prefix, to)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(read_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (key, value) = row.map_err(read_err)?;
            let date = key
                .strip_prefix(prefix)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            if let (Some(date), Some(total_steps)) = (date, parse_total(&value)) {
                records.push(DailyStepRecord { date, total_steps });
            }
        }
        Ok(records)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.kv_get(key).map_err(|e| StorageError::Read {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.kv_set(key, value).map_err(|e| StorageError::Write {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}
