//! Table schema installation
//!
//! Runs inside an open version-change window and creates only what is
//! missing, so installing the same description twice changes nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use idbridge_storage::{KeyPath, ObjectStoreParams, VersionChange};

use crate::envelope::IdbResponse;
use crate::error::CoreError;
use crate::Result;

/// Table name to table schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDescription {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, name: impl Into<String>, schema: TableSchema) -> Self {
        self.tables.insert(name.into(), schema);
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableSchema)> {
        self.tables.iter().map(|(name, schema)| (name.as_str(), schema))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Key path of the primary key
    pub key: String,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Add an index over `keys`; several keys make a compound index
    pub fn index<I, S>(mut self, name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(IndexSchema {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub keys: Vec<String>,
}

pub(crate) fn try_install(change: &mut VersionChange, schema: &SchemaDescription) -> Result<()> {
    for (table, table_schema) in schema.tables() {
        if change.contains_object_store(table) {
            tracing::debug!(table, "Table exists, skipping");
            continue;
        }

        change.create_object_store(
            table,
            ObjectStoreParams {
                key_path: Some(KeyPath::Single(table_schema.key.clone())),
                auto_increment: table_schema.auto_increment,
            },
        )?;

        for index in &table_schema.indexes {
            if change.index_names(table)?.contains(&index.name) {
                continue;
            }
            if index.keys.is_empty() {
                return Err(CoreError::SchemaInstall(format!(
                    "index '{}' on '{}' has no keys",
                    index.name, table
                )));
            }
            change.create_index(table, &index.name, KeyPath::from_fields(&index.keys))?;
        }

        tracing::info!(table, indexes = table_schema.indexes.len(), "Table created");
    }

    Ok(())
}

/// Create every table of `schema` missing from the database being upgraded
pub fn install_schema(change: &mut VersionChange, schema: &SchemaDescription) -> IdbResponse<()> {
    match try_install(change, schema) {
        Ok(()) => IdbResponse::ok(None),
        Err(e) => {
            tracing::warn!(error = %e, "Schema install failed");
            IdbResponse::error("Failed creating tables")
        }
    }
}
