//! idbridge Core
//!
//! Future-based request/response layer over the callback-driven object-store
//! engine. Every public operation resolves to an [`IdbResponse`] envelope;
//! failures are reported through its status, never as an `Err` or a panic.

mod client;
mod completion;
mod config;
mod counter;
mod envelope;
mod error;
mod opener;
mod reader;
mod schema;
mod setup;
mod writer;

pub use client::IdbClient;
pub use config::Config;
pub use envelope::{IdbResponse, IdbStatus};
pub use error::CoreError;
pub use opener::OpenResponse;
pub use schema::{install_schema, IndexSchema, SchemaDescription, TableSchema};
pub use writer::DbData;

// Re-export engine types that appear in the public API
pub use idbridge_storage::{Connection, Key, StorageError, VersionChange};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
