//! Database migrations for fieldsync.
//!
//! Each migration is a function that upgrades the schema by one version.
//! Migrations are run automatically when the database is opened.

use rusqlite::Connection;

use crate::error::FieldsyncError;

/// Current schema version.
const CURRENT_VERSION: i32 = 2;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
pub fn get_version(conn: &Connection) -> Result<i32, FieldsyncError> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| FieldsyncError::Database(format!("Failed to get schema version: {e}")))?;

    Ok(version)
}

/// Set the schema version in the database.
fn set_version(conn: &Connection, version: i32) -> Result<(), FieldsyncError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| FieldsyncError::Database(format!("Failed to set schema version: {e}")))
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<(), FieldsyncError> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

/// Run a specific migration.
fn run_migration(conn: &Connection, version: i32) -> Result<(), FieldsyncError> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(FieldsyncError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: Initial schema.
///
/// Creates tables for:
/// - `sync_queue`: Offline mutation queue
/// - `cached_records`: Per-collection offline read cache
fn migrate_v1(conn: &Connection) -> Result<(), FieldsyncError> {
    conn.execute_batch(
        r"
        -- Sync queue for offline mutations
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 1,
            depends_on INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_attempt TEXT,
            next_eligible_at TEXT,
            last_error TEXT,
            result TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status
        ON sync_queue(status);

        CREATE INDEX IF NOT EXISTS idx_sync_queue_order
        ON sync_queue(priority, created_at, id);

        -- Offline read cache
        CREATE TABLE IF NOT EXISTS cached_records (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (collection, key)
        );

        CREATE INDEX IF NOT EXISTS idx_cached_records_updated
        ON cached_records(collection, updated_at);
        ",
    )
    .map_err(|e| FieldsyncError::Database(format!("Migration v1 failed: {e}")))
}

/// Migration v2: idempotency tokens, item origin and sync bookkeeping.
fn migrate_v2(conn: &Connection) -> Result<(), FieldsyncError> {
    conn.execute_batch(
        r"
        ALTER TABLE sync_queue ADD COLUMN idempotency_key TEXT NOT NULL DEFAULT '';
        ALTER TABLE sync_queue ADD COLUMN origin TEXT NOT NULL DEFAULT 'app';

        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| FieldsyncError::Database(format!("Migration v2 failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_schema() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);

        conn.execute(
            "INSERT INTO sync_queue (operation_type, payload, created_at, idempotency_key)
             VALUES ('plot_update', '{\"id\":\"p1\"}', '2024-01-01T10:00:00Z', 'k1')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO cached_records (collection, key, value, updated_at)
             VALUES ('plots', 'p1', '{}', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES ('last_sync', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();

        let origin: String = conn
            .query_row("SELECT origin FROM sync_queue LIMIT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(origin, "app");
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();
        set_version(&conn, 1).unwrap();

        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), 2);
        conn.execute("INSERT INTO sync_meta (key, value) VALUES ('a', 'b')", [])
            .unwrap();
    }

    #[test]
    fn test_get_version_new_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), 0);
    }
}
