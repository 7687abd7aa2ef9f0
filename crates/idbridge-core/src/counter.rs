//! Exact-match index counts

use idbridge_storage::{Factory, Key, TransactionMode};

use crate::completion;
use crate::error::CoreError;
use crate::opener::open_database;
use crate::Result;

pub(crate) async fn count_records(
    factory: &Factory,
    name: &str,
    version: u64,
    table: &str,
    index: &str,
    query: &Key,
) -> Result<u64> {
    let conn = open_database(factory, name, version)
        .await
        .into_connection()?;

    let tx = conn.transaction(&[table], TransactionMode::ReadOnly)?;
    let request = tx.object_store(table)?.index(index)?.count(query)?;
    let done = completion::watch_request(&request);
    tx.commit();

    done.wait()
        .await
        .ok_or_else(|| CoreError::Transaction("count was dropped".to_string()))?
        .map_err(CoreError::Transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaDescription, TableSchema};
    use crate::setup::setup_database;
    use crate::writer::{save_records, DbData};
    use idbridge_storage::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_count_matches() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let schema = SchemaDescription::new().table(
            "items",
            TableSchema::new("id").auto_increment().index("byTag", ["tag"]),
        );
        drop(setup_database(&factory, "notes", 1, &schema).await.unwrap());

        let batch = DbData::Many(vec![json!({"tag": "x"}), json!({"tag": "x"}), json!({"tag": "y"})]);
        save_records(&factory, "notes", 1, "items", batch).await.unwrap();

        for (tag, expected) in [("x", 2), ("y", 1), ("z", 0)] {
            let count = count_records(&factory, "notes", 1, "items", "byTag", &Key::from(tag))
                .await
                .unwrap();
            assert_eq!(count, expected, "tag {}", tag);
        }
    }

    #[tokio::test]
    async fn test_count_on_missing_database_needs_upgrade() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let result = count_records(&factory, "notes", 1, "items", "byTag", &Key::from("x")).await;
        assert!(matches!(result, Err(CoreError::OpenFailure(_))));
    }
}
