//! Database connection and catalog reads

use parking_lot::Mutex;
use rusqlite::{Connection as SqliteConnection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::key::KeyPath;
use crate::migrations::run_migrations;
use crate::Result;

/// Schema of one object store as seen by a connection
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoreInfo {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub indexes: BTreeMap<String, KeyPath>,
}

/// All object stores of one named database
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Catalog {
    pub stores: BTreeMap<String, StoreInfo>,
}

/// Backing store shared by every object-store database of a factory
pub struct Database {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = SqliteConnection::open(path)?;

        // Enable foreign keys
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // WAL mode for better concurrent performance
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        // Run migrations
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteConnection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` in a SQLite transaction; an `Err` rolls everything back
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteConnection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Stored version of a named database, 0 when it does not exist
    pub fn stored_version(&self, name: &str) -> Result<u64> {
        self.with_connection(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT version FROM databases WHERE name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.map(|v| v as u64).unwrap_or(0))
        })
    }

    /// Names and versions of all databases
    pub fn databases(&self) -> Result<Vec<(String, u64)>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT name, version FROM databases ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub(crate) fn load_catalog(&self, name: &str) -> Result<Catalog> {
        self.with_connection(|conn| {
            let mut catalog = Catalog::default();

            let mut stmt = conn.prepare(
                "SELECT name, key_path, auto_increment FROM object_stores WHERE db = ?1",
            )?;
            let stores = stmt
                .query_map([name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i32>(2)? != 0,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (store, key_path, auto_increment) in stores {
                let key_path = key_path.as_deref().map(KeyPath::from_json).transpose()?;
                catalog.stores.insert(
                    store,
                    StoreInfo {
                        key_path,
                        auto_increment,
                        indexes: BTreeMap::new(),
                    },
                );
            }

            let mut stmt =
                conn.prepare("SELECT store, name, key_path FROM indexes WHERE db = ?1")?;
            let indexes = stmt
                .query_map([name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (store, index, key_path) in indexes {
                if let Some(info) = catalog.stores.get_mut(&store) {
                    info.indexes.insert(index, KeyPath::from_json(&key_path)?);
                }
            }

            Ok(catalog)
        })
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let count: i32 =
                conn.query_row("SELECT COUNT(*) FROM databases", [], |row| row.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unknown_database_has_version_zero() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.stored_version("missing").unwrap(), 0);
        assert!(db.load_catalog("missing").unwrap().stores.is_empty());
        assert!(db.databases().unwrap().is_empty());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO databases (name, version, created_at, updated_at)
                 VALUES ('notes', 1, '', '')",
                [],
            )?;
            Err(crate::StorageError::Aborted)
        });

        assert!(result.is_err());
        assert_eq!(db.stored_version("notes").unwrap(), 0);
    }
}
