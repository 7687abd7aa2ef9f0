//! Core error types
//!
//! Each variant maps to the fixed message its operation reports in the
//! response envelope.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database not opened: {0}")]
    OpenFailure(String),

    #[error("Database blocked (stored version {stored}, requested {requested})")]
    Blocked { stored: u64, requested: u64 },

    #[error("Schema not created: {0}")]
    SchemaInstall(String),

    #[error("Database is already set up")]
    AlreadySetUp,

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Storage error: {0}")]
    Storage(#[from] idbridge_storage::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected: {0}")]
    Unexpected(String),
}

impl CoreError {
    /// Message reported to callers in the response envelope
    pub fn message(&self) -> &'static str {
        match self {
            CoreError::OpenFailure(_) | CoreError::Blocked { .. } | CoreError::Io(_) => {
                "db not opened"
            }
            CoreError::SchemaInstall(_) => "db schema not created",
            CoreError::AlreadySetUp => "setup error",
            CoreError::Transaction(_) | CoreError::Storage(_) | CoreError::Serialization(_) => {
                "idb transaction error"
            }
            CoreError::Unexpected(_) => "unexpected error",
        }
    }
}
