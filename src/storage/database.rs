//! `SQLite` database connection and operations.
//!
//! The database is stored at `~/.fieldsync/fieldsync.db` and contains tables for:
//! - The sync queue (`sync_queue`)
//! - Offline read-cache records (`cached_records`)
//! - Sync bookkeeping such as the last successful pass (`sync_meta`)

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::debug;

use crate::config::Paths;
use crate::error::FieldsyncError;

use super::migrations;

/// Database connection wrapper.
///
/// The connection sits behind a mutex so one handle can be shared between the
/// sync engine, its timers and the application.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at the default location.
    ///
    /// Creates the database file and runs migrations if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open() -> Result<Self, FieldsyncError> {
        let paths = Paths::new()?;
        paths.ensure_dirs()?;
        Self::open_at(&paths.database)
    }

    /// Open the database at a specific path.
    ///
    /// Creates the database file and runs migrations if necessary. File
    /// databases use WAL with full synchronous writes so a write is on disk
    /// before the call returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &Path) -> Result<Self, FieldsyncError> {
        let conn = Connection::open(path).map_err(|e| {
            FieldsyncError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;

        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| FieldsyncError::Database(format!("Failed to enable WAL: {e}")))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened database");

        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;")
            .map_err(|e| FieldsyncError::Database(format!("Failed to configure database: {e}")))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;

        Ok(db)
    }

    /// Open an in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, FieldsyncError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            FieldsyncError::Database(format!("Failed to open in-memory database: {e}"))
        })?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| FieldsyncError::Database(format!("Failed to enable foreign keys: {e}")))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;

        Ok(db)
    }

    /// Run database migrations.
    fn migrate(&self) -> Result<(), FieldsyncError> {
        migrations::run(&self.conn.lock())
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, FieldsyncError> {
        migrations::get_version(&self.conn.lock())
    }

    /// Lock and return the underlying connection.
    ///
    /// Callers must not hold the guard across an `.await`.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
