//! Exact-match index lookups

use serde::de::DeserializeOwned;

use idbridge_storage::{Factory, Key, TransactionMode};

use crate::completion;
use crate::error::CoreError;
use crate::opener::open_database;
use crate::Result;

/// All records of `table` whose `index` key equals `query`, in index order
pub(crate) async fn load_records<T: DeserializeOwned>(
    factory: &Factory,
    name: &str,
    version: u64,
    table: &str,
    index: &str,
    query: &Key,
) -> Result<Vec<T>> {
    let conn = open_database(factory, name, version)
        .await
        .into_connection()?;

    let tx = conn.transaction(&[table], TransactionMode::ReadOnly)?;
    let request = tx.object_store(table)?.index(index)?.get_all(query)?;
    let done = completion::watch_request(&request);
    tx.commit();

    let values = done
        .wait()
        .await
        .ok_or_else(|| CoreError::Transaction("lookup was dropped".to_string()))?
        .map_err(CoreError::Transaction)?;
    tracing::debug!(db = %name, table, index, matches = values.len(), "Records loaded");

    values
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(CoreError::from))
        .collect()
}
