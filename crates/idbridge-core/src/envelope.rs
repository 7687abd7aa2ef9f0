//! Response envelope
//!
//! `is_success` is derived from the status by every constructor, so it is
//! true exactly when the status is `Ok`.

use serde::{Serialize, Serializer};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdbStatus {
    Ok,
    Error,
    DbBlocked,
    DbUpgrade,
}

impl IdbStatus {
    /// Numeric code used on the wire
    pub fn code(&self) -> u8 {
        match self {
            IdbStatus::Ok => 0,
            IdbStatus::Error => 1,
            IdbStatus::DbBlocked => 2,
            IdbStatus::DbUpgrade => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdbStatus::Ok => "OK",
            IdbStatus::Error => "ERROR",
            IdbStatus::DbBlocked => "DB_BLOCKED",
            IdbStatus::DbUpgrade => "DB_UPGRADE",
        }
    }
}

impl std::fmt::Display for IdbStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for IdbStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdbResponse<T> {
    is_success: bool,
    status: IdbStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<T>,
}

impl<T> IdbResponse<T> {
    pub fn ok(payload: Option<T>) -> Self {
        Self {
            is_success: true,
            status: IdbStatus::Ok,
            message: None,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            status: IdbStatus::Error,
            message: Some(message.into()),
            payload: None,
        }
    }

    /// Envelope for a failed operation; the cause is logged, the caller
    /// gets the operation's fixed message
    pub fn from_error(operation: &'static str, error: &CoreError) -> Self {
        tracing::warn!(operation, error = %error, "Operation failed");
        Self::error(error.message())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.is_success
    }

    pub fn status(&self) -> IdbStatus {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<T> {
        self.payload
    }

    pub fn map<U, F>(self, f: F) -> IdbResponse<U>
    where
        F: FnOnce(T) -> U,
    {
        IdbResponse {
            is_success: self.is_success,
            status: self.status,
            message: self.message,
            payload: self.payload.map(f),
        }
    }
}
