//! Database connection handle

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::database::{Catalog, StoreInfo};
use crate::error::StorageError;
use crate::factory::FactoryInner;
use crate::transaction::{Transaction, TransactionMode};
use crate::Result;

pub(crate) struct ConnectionInner {
    factory: Arc<FactoryInner>,
    id: u64,
    name: String,
    version: u64,
    catalog: RwLock<Catalog>,
    upgrading: AtomicBool,
    closed: AtomicBool,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let factory = Arc::clone(&self.factory);
        let name = std::mem::take(&mut self.name);
        let id = self.id;
        self.factory.events.queue(move || factory.close(&name, id));
    }
}

/// An open connection to one named database.
///
/// Clones share the connection; it closes when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        factory: Arc<FactoryInner>,
        id: u64,
        name: String,
        version: u64,
        catalog: Catalog,
        upgrading: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                factory,
                id,
                name,
                version,
                catalog: RwLock::new(catalog),
                upgrading: AtomicBool::new(upgrading),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// Object store names, sorted
    pub fn object_store_names(&self) -> Vec<String> {
        self.inner.catalog.read().stores.keys().cloned().collect()
    }

    /// Index names of one object store, sorted
    pub fn index_names(&self, store: &str) -> Result<Vec<String>> {
        self.inner
            .catalog
            .read()
            .stores
            .get(store)
            .map(|info| info.indexes.keys().cloned().collect())
            .ok_or_else(|| StorageError::NotFound(store.to_string()))
    }

    /// Start a transaction over `stores`.
    ///
    /// Not allowed while this connection's upgrade is still running.
    pub fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<Transaction> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState(
                "connection is closed".to_string(),
            ));
        }
        if self.inner.upgrading.load(Ordering::Acquire) {
            return Err(StorageError::InvalidState(
                "a version change is running".to_string(),
            ));
        }
        if stores.is_empty() {
            return Err(StorageError::InvalidAccess(
                "transaction scope is empty".to_string(),
            ));
        }

        let catalog = self.inner.catalog.read();
        for store in stores {
            if !catalog.stores.contains_key(*store) {
                return Err(StorageError::NotFound(store.to_string()));
            }
        }

        Ok(Transaction::new(
            self.clone(),
            stores.iter().map(|s| s.to_string()).collect(),
            mode,
        ))
    }

    pub(crate) fn store_info(&self, store: &str) -> Option<StoreInfo> {
        self.inner.catalog.read().stores.get(store).cloned()
    }

    pub(crate) fn catalog_snapshot(&self) -> Catalog {
        self.inner.catalog.read().clone()
    }

    pub(crate) fn factory(&self) -> &Arc<FactoryInner> {
        &self.inner.factory
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Install the committed schema and allow transactions
    pub(crate) fn finish_upgrade(&self, catalog: Catalog) {
        *self.inner.catalog.write() = catalog;
        self.inner.upgrading.store(false, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .finish()
    }
}
