//! Record writes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use idbridge_storage::{Factory, Key, Request, TransactionMode};

use crate::completion;
use crate::error::CoreError;
use crate::opener::open_database;
use crate::Result;

/// One record or a batch written in a single transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbData<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> DbData<T> {
    pub fn len(&self) -> usize {
        match self {
            DbData::Many(records) => records.len(),
            DbData::One(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append `data` to `table`. Returns the generated key for a single record.
pub(crate) async fn save_records<T: Serialize>(
    factory: &Factory,
    name: &str,
    version: u64,
    table: &str,
    data: DbData<T>,
) -> Result<Option<Key>> {
    let conn = open_database(factory, name, version)
        .await
        .into_connection()?;

    if data.is_empty() {
        tracing::debug!(db = %name, table, "Empty batch, nothing to save");
        return Ok(None);
    }

    let single = matches!(data, DbData::One(_));
    let values = match data {
        DbData::One(record) => vec![serde_json::to_value(record)?],
        DbData::Many(records) => records
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?,
    };

    let tx = conn.transaction(&[table], TransactionMode::ReadWrite)?;
    let store = tx.object_store(table)?;
    let (_resolver, done) = completion::watch_transaction(&tx);

    let count = values.len();
    let mut requests: Vec<Request<Key>> = Vec::with_capacity(count);
    for value in values {
        match store.add(value) {
            Ok(request) => requests.push(request),
            Err(e) => {
                tx.abort();
                return Err(e.into());
            }
        }
    }
    tx.commit();

    match done.wait().await {
        Some(Ok(())) => {
            tracing::debug!(db = %name, table, records = count, "Records saved");
            if single {
                Ok(requests.first().and_then(Request::result))
            } else {
                Ok(None)
            }
        }
        Some(Err(msg)) => Err(CoreError::Transaction(msg)),
        None => Err(CoreError::Transaction(
            "transaction was dropped".to_string(),
        )),
    }
}
