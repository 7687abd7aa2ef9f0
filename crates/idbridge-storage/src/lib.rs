//! idbridge Storage Engine
//!
//! A versioned object-store engine persisted in SQLite. The API is event
//! driven: opens, upgrades, transactions and requests report their outcome
//! through callbacks dispatched on a single cooperative event loop.

mod connection;
mod database;
mod error;
mod event_loop;
mod factory;
mod key;
mod migrations;
mod records;
mod transaction;
mod upgrade;

pub use connection::Connection;
pub use database::Database;
pub use error::StorageError;
pub use factory::{Factory, OpenCallbacks};
pub use key::{Key, KeyPath};
pub use transaction::{Index, ObjectStore, Request, Transaction, TransactionMode};
pub use upgrade::{ObjectStoreParams, VersionChange};

pub type Result<T> = std::result::Result<T, StorageError>;
