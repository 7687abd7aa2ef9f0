//! Public client
//!
//! Every operation opens its own connection and reports through an
//! `IdbResponse`; nothing is cached between calls.

use serde::de::DeserializeOwned;
use serde::Serialize;

use idbridge_storage::{Connection, Database, Factory, Key};

use crate::config::Config;
use crate::counter::count_records;
use crate::envelope::IdbResponse;
use crate::opener::{open_database, OpenResponse};
use crate::reader::load_records;
use crate::schema::SchemaDescription;
use crate::setup::{setup_database, SETUP_MESSAGE};
use crate::writer::{save_records, DbData};
use crate::Result;

pub struct IdbClient {
    config: Config,
    factory: Factory,
}

impl IdbClient {
    /// Open the configured store. Must be called from within a Tokio
    /// runtime, which hosts the engine's event loop.
    pub fn new(config: Config) -> Result<Self> {
        let db = match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                tracing::info!(path = %path.display(), "Opening database file");
                Database::open(path)?
            }
            None => Database::open_in_memory()?,
        };

        Ok(Self {
            config,
            factory: Factory::new(db),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Config::in_memory())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open `name` at `version` without touching its schema. An upgrade
    /// window in the response is owned by the caller.
    pub async fn open_db(&self, name: &str, version: u64) -> OpenResponse {
        open_database(&self.factory, name, version).await
    }

    /// Create the database with `schema` on its first open at `version`
    pub async fn setup_db(
        &self,
        name: &str,
        version: u64,
        schema: &SchemaDescription,
    ) -> IdbResponse<Connection> {
        match setup_database(&self.factory, name, version, schema).await {
            Ok(conn) => IdbResponse::ok(Some(conn)).with_message(SETUP_MESSAGE),
            Err(e) => IdbResponse::from_error("setup_db", &e),
        }
    }

    /// Append one record, or a batch in one transaction. Only a single
    /// record reports its key.
    pub async fn save_db_data<T: Serialize>(
        &self,
        name: &str,
        version: u64,
        table: &str,
        data: DbData<T>,
    ) -> IdbResponse<Key> {
        match save_records(&self.factory, name, version, table, data).await {
            Ok(key) => IdbResponse::ok(key),
            Err(e) => IdbResponse::from_error("save_db_data", &e),
        }
    }

    pub async fn load_db_data<T: DeserializeOwned>(
        &self,
        name: &str,
        version: u64,
        table: &str,
        index: &str,
        filter: impl Into<Key>,
    ) -> IdbResponse<Vec<T>> {
        let query = filter.into();
        match load_records(&self.factory, name, version, table, index, &query).await {
            Ok(records) => IdbResponse::ok(Some(records)),
            Err(e) => IdbResponse::from_error("load_db_data", &e),
        }
    }

    pub async fn count_db_data(
        &self,
        name: &str,
        version: u64,
        table: &str,
        index: &str,
        filter: impl Into<Key>,
    ) -> IdbResponse<u64> {
        let query = filter.into();
        match count_records(&self.factory, name, version, table, index, &query).await {
            Ok(count) => IdbResponse::ok(Some(count)),
            Err(e) => IdbResponse::from_error("count_db_data", &e),
        }
    }

    /// Names and stored versions of all databases
    pub fn databases(&self) -> Result<Vec<(String, u64)>> {
        Ok(self.factory.databases()?)
    }
}
