//! Record, index and schema statements
//!
//! Every function here runs inside a SQLite transaction opened by the
//! caller, so a failure anywhere leaves the catalog untouched.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::database::StoreInfo;
use crate::error::StorageError;
use crate::key::{Key, KeyPath, MAX_GENERATED_KEY};
use crate::Result;

/// Insert a new record, generating its key when the store allows it.
///
/// Fails with `Constraint` if a record with the same key already exists.
pub(crate) fn add_record(
    conn: &Connection,
    db: &str,
    store: &str,
    info: &StoreInfo,
    mut value: Value,
) -> Result<Key> {
    let key = match (&info.key_path, info.auto_increment) {
        (Some(key_path), auto_increment) => match key_path.extract(&value) {
            Some(key) => {
                let key = key?;
                if auto_increment {
                    bump_generator(conn, db, store, &key)?;
                }
                key
            }
            None if auto_increment => {
                let key = next_generated_key(conn, db, store)?;
                key_path.inject(&mut value, &key)?;
                key
            }
            None => {
                return Err(StorageError::Data(format!(
                    "record has no value at key path of '{}'",
                    store
                )))
            }
        },
        (None, true) => next_generated_key(conn, db, store)?,
        (None, false) => {
            return Err(StorageError::Data(format!(
                "'{}' uses out-of-line keys and no key was provided",
                store
            )))
        }
    };

    let encoded = key.encode();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO records (db, store, key, value) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![db, store, encoded, serde_json::to_string(&value)?],
    )?;
    if inserted == 0 {
        return Err(StorageError::Constraint(format!(
            "key {:?} already exists in '{}'",
            key, store
        )));
    }

    for (index, key_path) in &info.indexes {
        insert_index_entry(conn, db, store, index, key_path, &value, &encoded)?;
    }

    Ok(key)
}

/// All records whose index key equals `key`, in index then primary key order
pub(crate) fn get_all_by_index(
    conn: &Connection,
    db: &str,
    store: &str,
    index: &str,
    key: &Key,
) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT r.value FROM index_entries e
         JOIN records r ON r.db = e.db AND r.store = e.store AND r.key = e.pkey
         WHERE e.db = ?1 AND e.store = ?2 AND e.idx = ?3 AND e.ikey = ?4
         ORDER BY e.ikey, e.pkey",
    )?;

    let raw = stmt
        .query_map(rusqlite::params![db, store, index, key.encode()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.iter()
        .map(|json| Ok(serde_json::from_str(json)?))
        .collect()
}

pub(crate) fn count_by_index(
    conn: &Connection,
    db: &str,
    store: &str,
    index: &str,
    key: &Key,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM index_entries
         WHERE db = ?1 AND store = ?2 AND idx = ?3 AND ikey = ?4",
        rusqlite::params![db, store, index, key.encode()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Record the new version, creating the database row on first upgrade
pub(crate) fn set_version(conn: &Connection, db: &str, version: u64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO databases (name, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(name) DO UPDATE SET version = excluded.version,
                                         updated_at = excluded.updated_at",
        rusqlite::params![db, version as i64, now],
    )?;
    Ok(())
}

pub(crate) fn create_store(
    conn: &Connection,
    db: &str,
    store: &str,
    key_path: Option<&KeyPath>,
    auto_increment: bool,
) -> Result<()> {
    let key_path = key_path.map(KeyPath::to_json).transpose()?;
    conn.execute(
        "INSERT INTO object_stores (db, name, key_path, auto_increment) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![db, store, key_path, auto_increment as i32],
    )?;
    Ok(())
}

/// Create an index and back-fill it from the records already in the store
pub(crate) fn create_index(
    conn: &Connection,
    db: &str,
    store: &str,
    index: &str,
    key_path: &KeyPath,
) -> Result<()> {
    conn.execute(
        "INSERT INTO indexes (db, store, name, key_path) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![db, store, index, key_path.to_json()?],
    )?;

    let mut stmt = conn.prepare("SELECT key, value FROM records WHERE db = ?1 AND store = ?2")?;
    let existing = stmt
        .query_map(rusqlite::params![db, store], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (pkey, json) in existing {
        let value: Value = serde_json::from_str(&json)?;
        insert_index_entry(conn, db, store, index, key_path, &value, &pkey)?;
    }

    Ok(())
}

/// Records whose index value is missing or not a valid key are not indexed
fn insert_index_entry(
    conn: &Connection,
    db: &str,
    store: &str,
    index: &str,
    key_path: &KeyPath,
    value: &Value,
    pkey: &[u8],
) -> Result<()> {
    let Some(Ok(ikey)) = key_path.extract(value) else {
        return Ok(());
    };

    conn.execute(
        "INSERT OR IGNORE INTO index_entries (db, store, idx, ikey, pkey)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![db, store, index, ikey.encode(), pkey],
    )?;
    Ok(())
}

fn next_generated_key(conn: &Connection, db: &str, store: &str) -> Result<Key> {
    let current: i64 = conn
        .query_row(
            "SELECT next_key FROM object_stores WHERE db = ?1 AND name = ?2",
            rusqlite::params![db, store],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::NotFound(store.to_string()))?;

    if current > MAX_GENERATED_KEY {
        return Err(StorageError::Constraint(format!(
            "key generator of '{}' is exhausted",
            store
        )));
    }

    conn.execute(
        "UPDATE object_stores SET next_key = ?3 WHERE db = ?1 AND name = ?2",
        rusqlite::params![db, store, current + 1],
    )?;

    Ok(Key::Number(current as f64))
}

/// An explicit numeric key moves the generator past it
fn bump_generator(conn: &Connection, db: &str, store: &str, key: &Key) -> Result<()> {
    let Some(n) = key.as_number() else {
        return Ok(());
    };

    let next = (n.floor() + 1.0).min(MAX_GENERATED_KEY as f64 + 1.0) as i64;
    conn.execute(
        "UPDATE object_stores SET next_key = MAX(next_key, ?3) WHERE db = ?1 AND name = ?2",
        rusqlite::params![db, store, next],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn items_store() -> StoreInfo {
        let mut indexes = BTreeMap::new();
        indexes.insert("byTag".to_string(), KeyPath::Single("tag".into()));
        StoreInfo {
            key_path: Some(KeyPath::Single("id".into())),
            auto_increment: true,
            indexes,
        }
    }

    fn setup(db: &Database) {
        db.transaction(|conn| {
            set_version(conn, "notes", 1)?;
            create_store(conn, "notes", "items", Some(&KeyPath::Single("id".into())), true)?;
            create_index(conn, "notes", "items", "byTag", &KeyPath::Single("tag".into()))
        })
        .unwrap();
    }

    #[test]
    fn test_generated_keys_and_lookup() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let info = items_store();

        let keys = db
            .transaction(|conn| {
                let a = add_record(conn, "notes", "items", &info, json!({"tag": "x", "text": "a"}))?;
                let b = add_record(conn, "notes", "items", &info, json!({"tag": "y", "text": "b"}))?;
                let c = add_record(conn, "notes", "items", &info, json!({"tag": "x", "text": "c"}))?;
                Ok(vec![a, b, c])
            })
            .unwrap();
        assert_eq!(keys, vec![Key::from(1), Key::from(2), Key::from(3)]);

        let found = db
            .with_connection(|conn| get_all_by_index(conn, "notes", "items", "byTag", &Key::from("x")))
            .unwrap();
        assert_eq!(
            found,
            vec![
                json!({"tag": "x", "text": "a", "id": 1}),
                json!({"tag": "x", "text": "c", "id": 3}),
            ]
        );

        let count = db
            .with_connection(|conn| count_by_index(conn, "notes", "items", "byTag", &Key::from("x")))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_explicit_key_bumps_generator() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let info = items_store();

        let next = db
            .transaction(|conn| {
                add_record(conn, "notes", "items", &info, json!({"id": 10, "tag": "x"}))?;
                add_record(conn, "notes", "items", &info, json!({"tag": "x"}))
            })
            .unwrap();
        assert_eq!(next, Key::from(11));
    }

    #[test]
    fn test_duplicate_key_is_constraint_error() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let info = items_store();

        let result = db.transaction(|conn| {
            add_record(conn, "notes", "items", &info, json!({"id": 1, "tag": "x"}))?;
            add_record(conn, "notes", "items", &info, json!({"id": 1, "tag": "y"}))
        });
        assert!(matches!(result, Err(StorageError::Constraint(_))));
    }

    #[test]
    fn test_index_backfill_and_unindexed_records() {
        let db = Database::open_in_memory().unwrap();
        setup(&db);
        let mut info = items_store();

        db.transaction(|conn| {
            add_record(conn, "notes", "items", &info, json!({"tag": "x", "lang": "en"}))?;
            add_record(conn, "notes", "items", &info, json!({"tag": "x"}))?;
            create_index(conn, "notes", "items", "byLang", &KeyPath::Single("lang".into()))
        })
        .unwrap();
        info.indexes
            .insert("byLang".to_string(), KeyPath::Single("lang".into()));

        let count = db
            .with_connection(|conn| count_by_index(conn, "notes", "items", "byLang", &Key::from("en")))
            .unwrap();
        assert_eq!(count, 1);
    }
}
