//! Database schema migrations for studytrack.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};
use tracing::warn;

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist.
fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: roster, blocks and attendance intervals.
///
/// Timestamps are fixed-width RFC 3339 UTC text, so string comparison in SQL
/// matches time order.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS students (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            external_id TEXT UNIQUE,
            enrolled    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS guardians (
            id         TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            name       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activities (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            assignable INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS scheduled_blocks (
            id          TEXT PRIMARY KEY,
            student_id  TEXT NOT NULL,
            title       TEXT NOT NULL,
            activity_id TEXT NOT NULL,
            start_at    TEXT NOT NULL,
            end_at      TEXT NOT NULL,
            assigned_by TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance_intervals (
            id              TEXT PRIMARY KEY,
            student_id      TEXT NOT NULL,
            linked_block_id TEXT,
            start_at        TEXT NOT NULL,
            end_at          TEXT,
            source          TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_guardians_student ON guardians(student_id);
        CREATE INDEX IF NOT EXISTS idx_blocks_student_start ON scheduled_blocks(student_id, start_at);
        CREATE INDEX IF NOT EXISTS idx_blocks_start ON scheduled_blocks(start_at);
        CREATE INDEX IF NOT EXISTS idx_intervals_block ON attendance_intervals(linked_block_id);
        CREATE INDEX IF NOT EXISTS idx_intervals_student_start ON attendance_intervals(student_id, start_at);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: once-per-block alert ledger and the open-interval index.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS alert_ledger (
            block_id   TEXT NOT NULL,
            kind       TEXT NOT NULL,
            emitted_at TEXT NOT NULL,
            PRIMARY KEY (block_id, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_intervals_open
            ON attendance_intervals(student_id) WHERE end_at IS NULL;",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'alert_ledger'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn v1_database_upgrades_to_v2() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema_version_table(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 1);

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);
    }
}
