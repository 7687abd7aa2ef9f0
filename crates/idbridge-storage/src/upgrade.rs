//! Version-change window
//!
//! Schema changes are staged on the `VersionChange` and written together
//! with the new version in one SQLite transaction on commit. Dropping a
//! `VersionChange` without committing aborts the upgrade.

use std::sync::Arc;

use crate::connection::Connection;
use crate::database::{Catalog, StoreInfo};
use crate::error::StorageError;
use crate::factory::{FactoryInner, OpenCallbacks};
use crate::key::KeyPath;
use crate::records;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct ObjectStoreParams {
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
}

#[derive(Debug)]
enum SchemaChange {
    CreateStore {
        name: String,
        params: ObjectStoreParams,
    },
    CreateIndex {
        store: String,
        name: String,
        key_path: KeyPath,
    },
}

pub struct VersionChange {
    factory: Arc<FactoryInner>,
    connection: Option<Connection>,
    old_version: u64,
    catalog: Catalog,
    changes: Vec<SchemaChange>,
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
    on_error: Option<Box<dyn FnOnce(&StorageError) + Send + 'static>>,
    request: OpenCallbacks,
}

impl VersionChange {
    pub(crate) fn new(
        factory: Arc<FactoryInner>,
        connection: Connection,
        old_version: u64,
        request: OpenCallbacks,
    ) -> Self {
        let catalog = connection.catalog_snapshot();

        Self {
            factory,
            connection: Some(connection),
            old_version,
            catalog,
            changes: Vec::new(),
            on_complete: None,
            on_error: None,
            request,
        }
    }

    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    pub fn new_version(&self) -> u64 {
        self.connection.as_ref().map(Connection::version).unwrap_or(0)
    }

    /// The connection being upgraded. It cannot start transactions until
    /// the upgrade has committed.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.clone()
    }

    /// Object store names including the ones staged in this upgrade
    pub fn object_store_names(&self) -> Vec<String> {
        self.catalog.stores.keys().cloned().collect()
    }

    pub fn contains_object_store(&self, name: &str) -> bool {
        self.catalog.stores.contains_key(name)
    }

    pub fn index_names(&self, store: &str) -> Result<Vec<String>> {
        self.catalog
            .stores
            .get(store)
            .map(|info| info.indexes.keys().cloned().collect())
            .ok_or_else(|| StorageError::NotFound(store.to_string()))
    }

    pub fn create_object_store(&mut self, name: &str, params: ObjectStoreParams) -> Result<()> {
        if self.contains_object_store(name) {
            return Err(StorageError::Constraint(format!(
                "object store '{}' already exists",
                name
            )));
        }

        if let Some(key_path) = &params.key_path {
            key_path.validate()?;
            if params.auto_increment && (key_path.is_compound() || key_path.is_empty_path()) {
                return Err(StorageError::InvalidAccess(format!(
                    "'{}' cannot auto-increment with key path {:?}",
                    name, key_path
                )));
            }
        }

        self.catalog.stores.insert(
            name.to_string(),
            StoreInfo {
                key_path: params.key_path.clone(),
                auto_increment: params.auto_increment,
                indexes: Default::default(),
            },
        );
        self.changes.push(SchemaChange::CreateStore {
            name: name.to_string(),
            params,
        });

        Ok(())
    }

    pub fn create_index(&mut self, store: &str, name: &str, key_path: KeyPath) -> Result<()> {
        key_path.validate()?;

        let info = self
            .catalog
            .stores
            .get_mut(store)
            .ok_or_else(|| StorageError::NotFound(store.to_string()))?;
        if info.indexes.contains_key(name) {
            return Err(StorageError::Constraint(format!(
                "index '{}' already exists on '{}'",
                name, store
            )));
        }

        info.indexes.insert(name.to_string(), key_path.clone());
        self.changes.push(SchemaChange::CreateIndex {
            store: store.to_string(),
            name: name.to_string(),
            key_path,
        });

        Ok(())
    }

    /// Fired once the upgrade is durable
    pub fn on_complete<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
    }

    pub fn on_error<F>(&mut self, f: F)
    where
        F: FnOnce(&StorageError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
    }

    pub fn commit(mut self) {
        self.finish(true);
    }

    pub fn abort(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, commit: bool) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let factory = Arc::clone(&self.factory);
        let catalog = std::mem::take(&mut self.catalog);
        let changes = std::mem::take(&mut self.changes);
        let on_complete = self.on_complete.take();
        let on_error = self.on_error.take();
        let request = std::mem::take(&mut self.request);
        let old_version = self.old_version;

        self.factory.events.queue(move || {
            let name = connection.name().to_string();
            let version = connection.version();

            let outcome = if commit {
                factory
                    .db
                    .transaction(|conn| apply_changes(conn, &name, version, &changes))
            } else {
                Err(StorageError::Aborted)
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        db = %name,
                        old_version,
                        new_version = version,
                        changes = changes.len(),
                        "Upgrade committed"
                    );
                    connection.finish_upgrade(catalog);
                    if let Some(cb) = on_complete {
                        cb();
                    }
                    factory.upgrade_finished(&name, None);
                    if let Some(cb) = request.on_success {
                        cb(connection);
                    }
                }
                Err(error) => {
                    tracing::warn!(db = %name, error = %error, "Upgrade aborted");
                    connection.mark_closed();
                    if let Some(cb) = on_error {
                        cb(&error);
                    }
                    factory.upgrade_finished(&name, Some(connection.id()));
                    if let Some(cb) = request.on_error {
                        cb(error);
                    }
                }
            }
        });
    }
}

impl Drop for VersionChange {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for VersionChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionChange")
            .field("connection", &self.connection)
            .field("old_version", &self.old_version)
            .field("changes", &self.changes)
            .finish()
    }
}

fn apply_changes(
    conn: &rusqlite::Connection,
    db: &str,
    version: u64,
    changes: &[SchemaChange],
) -> Result<()> {
    records::set_version(conn, db, version)?;

    for change in changes {
        match change {
            SchemaChange::CreateStore { name, params } => {
                records::create_store(
                    conn,
                    db,
                    name,
                    params.key_path.as_ref(),
                    params.auto_increment,
                )?;
            }
            SchemaChange::CreateIndex {
                store,
                name,
                key_path,
            } => {
                records::create_index(conn, db, store, name, key_path)?;
            }
        }
    }

    Ok(())
}
