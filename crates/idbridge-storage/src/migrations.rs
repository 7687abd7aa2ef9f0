//! Catalog migrations
//!
//! Internal tables backing every object-store database: the database
//! registry, object stores, indexes, records and index entries.

use crate::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<i32, _> =
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        });

    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(rusqlite::Error::SqliteFailure(_, _)) => {
            // Table doesn't exist yet
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                [],
            )?;
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: object-store catalog");

    // One row per named database; version 0 never hits disk
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS databases (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
    )?;

    // key_path holds the JSON form of a KeyPath, NULL for out-of-line keys
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS object_stores (
            db TEXT NOT NULL,
            name TEXT NOT NULL,
            key_path TEXT,
            auto_increment INTEGER NOT NULL DEFAULT 0,
            next_key INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (db, name),
            FOREIGN KEY (db) REFERENCES databases(name) ON DELETE CASCADE
        );
    "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS indexes (
            db TEXT NOT NULL,
            store TEXT NOT NULL,
            name TEXT NOT NULL,
            key_path TEXT NOT NULL,
            PRIMARY KEY (db, store, name),
            FOREIGN KEY (db, store) REFERENCES object_stores(db, name) ON DELETE CASCADE
        );
    "#,
    )?;

    // Keys are order-preserving encodings, so BLOB order is key order
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            db TEXT NOT NULL,
            store TEXT NOT NULL,
            key BLOB NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (db, store, key),
            FOREIGN KEY (db, store) REFERENCES object_stores(db, name) ON DELETE CASCADE
        );
    "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            db TEXT NOT NULL,
            store TEXT NOT NULL,
            idx TEXT NOT NULL,
            ikey BLOB NOT NULL,
            pkey BLOB NOT NULL,
            PRIMARY KEY (db, store, idx, ikey, pkey),
            FOREIGN KEY (db, store, idx) REFERENCES indexes(db, store, name) ON DELETE CASCADE,
            FOREIGN KEY (db, store, pkey) REFERENCES records(db, store, key) ON DELETE CASCADE
        );
    "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('databases', 'object_stores', 'indexes', 'records', 'index_entries')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
