//! Versioned open
//!
//! Turns the engine's open events into one `OpenResponse`. Whichever event
//! arrives first wins; anything later is dropped, which closes a late
//! connection or aborts a late upgrade window.

use idbridge_storage::{Connection, Factory, OpenCallbacks, StorageError, VersionChange};

use crate::completion;
use crate::envelope::IdbStatus;
use crate::error::CoreError;
use crate::Result;

#[derive(Debug)]
pub enum OpenResponse {
    /// Opened at the stored version
    Ready(Connection),
    /// The version-change window is open and owned by the caller
    Upgrade(VersionChange),
    /// Held up by other connections, or older than the stored version
    Blocked { stored: u64, requested: u64 },
    Failed(CoreError),
}

impl OpenResponse {
    pub fn status(&self) -> IdbStatus {
        match self {
            OpenResponse::Ready(_) => IdbStatus::Ok,
            OpenResponse::Upgrade(_) => IdbStatus::DbUpgrade,
            OpenResponse::Blocked { .. } => IdbStatus::DbBlocked,
            OpenResponse::Failed(_) => IdbStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OpenResponse::Ready(_) | OpenResponse::Upgrade(_))
    }

    /// The connection of a plain open. An upgrade window is aborted, since
    /// data operations never create tables.
    pub fn into_connection(self) -> Result<Connection> {
        match self {
            OpenResponse::Ready(conn) => Ok(conn),
            OpenResponse::Upgrade(change) => {
                tracing::warn!(
                    old_version = change.old_version(),
                    new_version = change.new_version(),
                    "Aborting unexpected version change"
                );
                drop(change);
                Err(CoreError::OpenFailure(
                    "database needs an upgrade".to_string(),
                ))
            }
            OpenResponse::Blocked { stored, requested } => {
                Err(CoreError::Blocked { stored, requested })
            }
            OpenResponse::Failed(error) => Err(error),
        }
    }
}

pub(crate) async fn open_database(factory: &Factory, name: &str, version: u64) -> OpenResponse {
    let (resolver, completion) = completion::channel();

    let on_success = resolver.clone();
    let on_error = resolver.clone();
    let on_blocked = resolver.clone();
    // a blocked caller is answered right away, so the request must not
    // stay queued in front of later opens
    let callbacks = OpenCallbacks::new()
        .withdraw_on_blocked()
        .on_success(move |conn| {
            on_success.resolve(OpenResponse::Ready(conn));
        })
        .on_error(move |error| {
            let response = match error {
                StorageError::Version { requested, stored } => {
                    OpenResponse::Blocked { stored, requested }
                }
                other => OpenResponse::Failed(CoreError::OpenFailure(other.to_string())),
            };
            on_error.resolve(response);
        })
        .on_blocked(move |stored, requested| {
            on_blocked.resolve(OpenResponse::Blocked { stored, requested });
        })
        .on_upgrade_needed(move |change| {
            resolver.resolve(OpenResponse::Upgrade(change));
        });

    if let Err(e) = factory.open(name, version, callbacks) {
        tracing::warn!(db = %name, version, error = %e, "Open rejected");
        return OpenResponse::Failed(CoreError::OpenFailure(e.to_string()));
    }

    let response = completion.wait().await.unwrap_or_else(|| {
        OpenResponse::Failed(CoreError::OpenFailure(
            "open request was dropped".to_string(),
        ))
    });
    tracing::debug!(db = %name, version, status = %response.status(), "Open resolved");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbridge_storage::Database;

    fn factory() -> Factory {
        Factory::new(Database::open_in_memory().unwrap())
    }

    async fn create(factory: &Factory, name: &str, version: u64) -> Connection {
        match open_database(factory, name, version).await {
            OpenResponse::Upgrade(mut change) => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                change.on_complete(move || {
                    let _ = tx.send(());
                });
                let conn = change.connection().unwrap();
                change.commit();
                rx.await.unwrap();
                conn
            }
            other => panic!("expected upgrade, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fresh_database_needs_upgrade() {
        let factory = factory();
        let response = open_database(&factory, "notes", 1).await;
        assert_eq!(response.status(), IdbStatus::DbUpgrade);
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_same_version_is_ready() {
        let factory = factory();
        drop(create(&factory, "notes", 2).await);

        let response = open_database(&factory, "notes", 2).await;
        assert_eq!(response.status(), IdbStatus::Ok);
        assert_eq!(response.into_connection().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_lower_version_is_blocked() {
        let factory = factory();
        drop(create(&factory, "notes", 2).await);

        let response = open_database(&factory, "notes", 1).await;
        assert!(matches!(
            response,
            OpenResponse::Blocked {
                stored: 2,
                requested: 1
            }
        ));
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_upgrade_blocked_by_open_connection() {
        let factory = factory();
        let held = create(&factory, "notes", 1).await;

        let response = open_database(&factory, "notes", 2).await;
        assert_eq!(response.status(), IdbStatus::DbBlocked);

        // the blocked request left the queue, so the stored version opens
        // while `held` is still open
        let response = open_database(&factory, "notes", 1).await;
        assert_eq!(response.status(), IdbStatus::Ok);
        drop(held);

        // and it never upgrades later on its own
        let response = open_database(&factory, "notes", 1).await;
        assert_eq!(response.status(), IdbStatus::Ok);
        assert_eq!(factory.databases().unwrap(), vec![("notes".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_version_zero_fails() {
        let factory = factory();
        let response = open_database(&factory, "notes", 0).await;
        assert_eq!(response.status(), IdbStatus::Error);
        assert!(matches!(
            response.into_connection(),
            Err(CoreError::OpenFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_upgrade_is_not_a_connection() {
        let factory = factory();
        let response = open_database(&factory, "notes", 1).await;
        assert!(matches!(
            response.into_connection(),
            Err(CoreError::OpenFailure(_))
        ));
        assert!(factory.databases().unwrap().is_empty());
    }
}
