//! Storage error types
//!
//! Variant names follow the DOMException names an object-store engine
//! reports, so callers can tell a constraint violation from a missing store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Requested version {requested} is lower than stored version {stored}")]
    Version { requested: u64, stored: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint error: {0}")]
    Constraint(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Invalid key path: {0}")]
    Syntax(String),

    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transaction is read-only")]
    ReadOnly,

    #[error("Transaction is no longer active")]
    TransactionInactive,

    #[error("Transaction aborted")]
    Aborted,
}

impl StorageError {
    /// DOMException-style name, used in log fields
    pub fn name(&self) -> &'static str {
        match self {
            StorageError::Sqlite(_) | StorageError::Json(_) => "UnknownError",
            StorageError::Type(_) => "TypeError",
            StorageError::Version { .. } => "VersionError",
            StorageError::NotFound(_) => "NotFoundError",
            StorageError::Constraint(_) => "ConstraintError",
            StorageError::Data(_) => "DataError",
            StorageError::Syntax(_) => "SyntaxError",
            StorageError::InvalidAccess(_) => "InvalidAccessError",
            StorageError::InvalidState(_) => "InvalidStateError",
            StorageError::ReadOnly => "ReadOnlyError",
            StorageError::TransactionInactive => "TransactionInactiveError",
            StorageError::Aborted => "AbortError",
        }
    }
}
