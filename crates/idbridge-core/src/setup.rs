//! Open a database and install its schema on first use

use idbridge_storage::{Connection, Factory};

use crate::completion;
use crate::error::CoreError;
use crate::opener::{open_database, OpenResponse};
use crate::schema::{try_install, SchemaDescription};
use crate::Result;

pub(crate) const SETUP_MESSAGE: &str = "db with schema created successfully";

pub(crate) async fn setup_database(
    factory: &Factory,
    name: &str,
    version: u64,
    schema: &SchemaDescription,
) -> Result<Connection> {
    let mut change = match open_database(factory, name, version).await {
        OpenResponse::Upgrade(change) => change,
        OpenResponse::Ready(_) => return Err(CoreError::AlreadySetUp),
        OpenResponse::Blocked { stored, requested } => {
            return Err(CoreError::Blocked { stored, requested })
        }
        OpenResponse::Failed(e) => return Err(e),
    };

    if let Err(e) = try_install(&mut change, schema) {
        change.abort();
        return Err(CoreError::SchemaInstall(e.to_string()));
    }

    let conn = change
        .connection()
        .ok_or_else(|| CoreError::Unexpected("version change has no connection".to_string()))?;

    let (resolver, done) = completion::channel();
    let on_complete = resolver.clone();
    change.on_complete(move || {
        on_complete.resolve(Ok(()));
    });
    change.on_error(move |error| {
        resolver.resolve(Err(error.to_string()));
    });
    change.commit();

    match done.wait().await {
        Some(Ok(())) => {
            tracing::info!(db = %name, version, "Database set up");
            Ok(conn)
        }
        Some(Err(msg)) => Err(CoreError::SchemaInstall(msg)),
        None => Err(CoreError::SchemaInstall(
            "version change was dropped".to_string(),
        )),
    }
}
