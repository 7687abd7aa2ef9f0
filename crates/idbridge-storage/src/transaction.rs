//! Transactions and requests
//!
//! Requests queue on a transaction and run, in order, inside one SQLite
//! transaction when the transaction commits (explicitly or on drop). The
//! first failing request aborts the whole transaction.

use parking_lot::Mutex;
use rusqlite::Connection as SqliteConnection;
use serde_json::Value;
use std::sync::Arc;

use crate::connection::Connection;
use crate::database::StoreInfo;
use crate::error::StorageError;
use crate::key::Key;
use crate::records;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl TransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
        }
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

type SuccessCallback<T> = Box<dyn FnOnce(T) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(&StorageError) + Send + 'static>;

struct RequestState<T> {
    result: Option<T>,
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

/// Pending result of one operation inside a transaction
pub struct Request<T> {
    state: Arc<Mutex<RequestState<T>>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RequestState {
                result: None,
                on_success: None,
                on_error: None,
            })),
        }
    }

    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.state.lock().on_success = Some(Box::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: FnOnce(&StorageError) + Send + 'static,
    {
        self.state.lock().on_error = Some(Box::new(f));
    }

    /// The result, once the request has succeeded
    pub fn result(&self) -> Option<T> {
        self.state.lock().result.clone()
    }

    fn set_result(&self, value: T) {
        self.state.lock().result = Some(value);
    }
}

/// Delivery side of a request, independent of its result type
trait Settle: Send {
    fn succeed(&self);
    fn fail(&self, error: &StorageError);
}

impl<T: Clone + Send + 'static> Settle for Request<T> {
    fn succeed(&self) {
        let (callback, result) = {
            let mut state = self.state.lock();
            (state.on_success.take(), state.result.clone())
        };
        if let (Some(cb), Some(result)) = (callback, result) {
            cb(result);
        }
    }

    fn fail(&self, error: &StorageError) {
        let callback = self.state.lock().on_error.take();
        if let Some(cb) = callback {
            cb(error);
        }
    }
}

type Exec = Box<dyn FnOnce(&SqliteConnection, &str) -> Result<()> + Send + 'static>;

struct Operation {
    request: Box<dyn Settle>,
    exec: Exec,
}

struct TxState {
    connection: Connection,
    scope: Vec<String>,
    mode: TransactionMode,
    operations: Vec<Operation>,
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
    on_error: Option<Box<dyn FnMut(&StorageError) + Send + 'static>>,
    on_abort: Option<Box<dyn FnOnce(&StorageError) + Send + 'static>>,
    aborted: bool,
    finished: bool,
}

impl TxState {
    fn queue<T, F>(&mut self, exec: F) -> Result<Request<T>>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&SqliteConnection, &str) -> Result<T> + Send + 'static,
    {
        if self.finished {
            return Err(StorageError::TransactionInactive);
        }

        let request = Request::new();
        let target = request.clone();
        self.operations.push(Operation {
            request: Box::new(request.clone()),
            exec: Box::new(move |conn: &SqliteConnection, db: &str| {
                target.set_result(exec(conn, db)?);
                Ok(())
            }),
        });

        Ok(request)
    }
}

pub struct Transaction {
    state: Arc<Mutex<TxState>>,
}

impl Transaction {
    pub(crate) fn new(connection: Connection, scope: Vec<String>, mode: TransactionMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(TxState {
                connection,
                scope,
                mode,
                operations: Vec::new(),
                on_complete: None,
                on_error: None,
                on_abort: None,
                aborted: false,
                finished: false,
            })),
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.state.lock().mode
    }

    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        let state = self.state.lock();
        if !state.scope.iter().any(|s| s == name) {
            return Err(StorageError::NotFound(format!(
                "'{}' is not in the transaction scope",
                name
            )));
        }
        let info = state
            .connection
            .store_info(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;

        Ok(ObjectStore {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            info,
        })
    }

    /// Fired after every request succeeded and the changes are durable
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.lock().on_complete = Some(Box::new(f));
    }

    /// Fired once per failed request, including those failed by the abort
    pub fn on_error<F>(&self, f: F)
    where
        F: FnMut(&StorageError) + Send + 'static,
    {
        self.state.lock().on_error = Some(Box::new(f));
    }

    pub fn on_abort<F>(&self, f: F)
    where
        F: FnOnce(&StorageError) + Send + 'static,
    {
        self.state.lock().on_abort = Some(Box::new(f));
    }

    /// Run the queued requests. Dropping the transaction does the same.
    pub fn commit(self) {
        self.finish();
    }

    /// Discard the queued requests; they fail with `Aborted`
    pub fn abort(self) {
        self.state.lock().aborted = true;
        self.finish();
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;

        let connection = state.connection.clone();
        let mode = state.mode;
        let aborted = state.aborted;
        let operations = std::mem::take(&mut state.operations);
        let on_complete = state.on_complete.take();
        let on_error = state.on_error.take();
        let on_abort = state.on_abort.take();
        drop(state);

        let events = connection.factory().events.clone();
        events.queue(move || {
            let handlers = Handlers {
                on_complete,
                on_error,
                on_abort,
            };
            run(connection, mode, aborted, operations, handlers);
        });
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

struct Handlers {
    on_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
    on_error: Option<Box<dyn FnMut(&StorageError) + Send + 'static>>,
    on_abort: Option<Box<dyn FnOnce(&StorageError) + Send + 'static>>,
}

fn run(
    connection: Connection,
    mode: TransactionMode,
    aborted: bool,
    operations: Vec<Operation>,
    handlers: Handlers,
) {
    let Handlers {
        on_complete,
        mut on_error,
        on_abort,
    } = handlers;
    let db_name = connection.name().to_string();
    let total = operations.len();
    let (requests, execs): (Vec<_>, Vec<_>) = operations
        .into_iter()
        .map(|op| (op.request, op.exec))
        .unzip();

    let mut executed = 0;
    let mut failure: Option<StorageError> = None;
    let outcome = if aborted {
        Err(StorageError::Aborted)
    } else {
        connection.factory().db.transaction(|conn| {
            for exec in execs {
                if let Err(e) = exec(conn, &db_name) {
                    failure = Some(e);
                    return Err(StorageError::Aborted);
                }
                executed += 1;
            }
            Ok(())
        })
    };

    let abort_cause = match (outcome, failure) {
        (Ok(()), _) => None,
        (Err(_), Some(cause)) => Some(cause),
        (Err(e), None) => Some(e),
    };

    let abort_error = StorageError::Aborted;
    for (i, request) in requests.iter().enumerate() {
        if i < executed {
            request.succeed();
            continue;
        }
        // the failing request gets the cause, the rest were never run
        let error = match (&abort_cause, i == executed) {
            (Some(cause), true) => cause,
            _ => &abort_error,
        };
        request.fail(error);
        if let Some(cb) = on_error.as_mut() {
            cb(error);
        }
    }

    match abort_cause {
        None => {
            tracing::debug!(db = %db_name, %mode, requests = total, "Transaction complete");
            if let Some(cb) = on_complete {
                cb();
            }
        }
        Some(cause) => {
            tracing::warn!(
                db = %db_name,
                %mode,
                error = %cause,
                kind = cause.name(),
                "Transaction aborted"
            );
            if let Some(cb) = on_abort {
                cb(&cause);
            }
        }
    }
}

/// An object store inside a transaction
pub struct ObjectStore {
    state: Arc<Mutex<TxState>>,
    name: String,
    info: StoreInfo,
}

impl ObjectStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_names(&self) -> Vec<String> {
        self.info.indexes.keys().cloned().collect()
    }

    /// Queue an insert; the request yields the record's key
    pub fn add(&self, value: Value) -> Result<Request<Key>> {
        let mut state = self.state.lock();
        if state.mode == TransactionMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }

        let store = self.name.clone();
        let info = self.info.clone();
        state.queue(move |conn, db| records::add_record(conn, db, &store, &info, value))
    }

    pub fn index(&self, name: &str) -> Result<Index> {
        if !self.info.indexes.contains_key(name) {
            return Err(StorageError::NotFound(format!(
                "index '{}' on '{}'",
                name, self.name
            )));
        }

        Ok(Index {
            state: Arc::clone(&self.state),
            store: self.name.clone(),
            name: name.to_string(),
        })
    }
}

/// A named index of an object store inside a transaction
pub struct Index {
    state: Arc<Mutex<TxState>>,
    store: String,
    name: String,
}

impl Index {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an exact-match lookup returning every matching record
    pub fn get_all(&self, query: &Key) -> Result<Request<Vec<Value>>> {
        let (store, index, query) = (self.store.clone(), self.name.clone(), query.clone());
        self.state
            .lock()
            .queue(move |conn, db| records::get_all_by_index(conn, db, &store, &index, &query))
    }

    /// Queue an exact-match count
    pub fn count(&self, query: &Key) -> Result<Request<u64>> {
        let (store, index, query) = (self.store.clone(), self.name.clone(), query.clone());
        self.state
            .lock()
            .queue(move |conn, db| records::count_by_index(conn, db, &store, &index, &query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::factory::{Factory, OpenCallbacks};
    use crate::key::KeyPath;
    use crate::upgrade::ObjectStoreParams;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    async fn notes_connection(factory: &Factory) -> Connection {
        let (tx, rx) = oneshot::channel();
        factory
            .open(
                "notes",
                1,
                OpenCallbacks::new()
                    .on_upgrade_needed(|mut change| {
                        change
                            .create_object_store(
                                "items",
                                ObjectStoreParams {
                                    key_path: Some(KeyPath::Single("id".into())),
                                    auto_increment: true,
                                },
                            )
                            .unwrap();
                        change
                            .create_index("items", "byTag", KeyPath::Single("tag".into()))
                            .unwrap();
                        change.commit();
                    })
                    .on_success(move |conn| {
                        let _ = tx.send(conn);
                    }),
            )
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_add_then_query() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadWrite)
            .unwrap();
        let store = tx.object_store("items").unwrap();
        let first = store.add(json!({"tag": "x", "text": "a"})).unwrap();
        store.add(json!({"tag": "x", "text": "b"})).unwrap();
        store.add(json!({"tag": "y", "text": "c"})).unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        tx.on_complete(move || {
            let _ = done_tx.send(());
        });
        tx.commit();
        done_rx.await.unwrap();
        assert_eq!(first.result(), Some(Key::from(1)));

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadOnly)
            .unwrap();
        let index = tx.object_store("items").unwrap().index("byTag").unwrap();
        let records = index.get_all(&Key::from("x")).unwrap();
        let count = index.count(&Key::from("x")).unwrap();

        let (count_tx, count_rx) = oneshot::channel();
        count.on_success(move |n| {
            let _ = count_tx.send(n);
        });
        drop(tx);

        assert_eq!(count_rx.await.unwrap(), 2);
        let records = records.result().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["text"], "a");
        assert_eq!(records[1]["text"], "b");
    }

    #[tokio::test]
    async fn test_failed_add_aborts_and_rolls_back() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadWrite)
            .unwrap();
        let store = tx.object_store("items").unwrap();
        store.add(json!({"id": 5, "tag": "x"})).unwrap();
        store.add(json!({"id": 5, "tag": "x"})).unwrap();
        store.add(json!({"id": 6, "tag": "x"})).unwrap();

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = oneshot::channel();
        tx.on_error(move |e| {
            let _ = err_tx.send(e.name());
        });
        tx.on_abort(move |e| {
            let _ = abort_tx.send(e.name());
        });
        tx.commit();

        assert_eq!(abort_rx.await.unwrap(), "ConstraintError");
        // one error per failed request: the duplicate, then the unexecuted add
        assert_eq!(err_rx.recv().await, Some("ConstraintError"));
        assert_eq!(err_rx.recv().await, Some("AbortError"));

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadOnly)
            .unwrap();
        let count = tx
            .object_store("items")
            .unwrap()
            .index("byTag")
            .unwrap()
            .count(&Key::from("x"))
            .unwrap();
        let (count_tx, count_rx) = oneshot::channel();
        count.on_success(move |n| {
            let _ = count_tx.send(n);
        });
        tx.commit();
        assert_eq!(count_rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_readonly_rejects_add() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadOnly)
            .unwrap();
        let store = tx.object_store("items").unwrap();
        assert!(matches!(
            store.add(json!({"tag": "x"})),
            Err(StorageError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn test_unknown_store_and_index() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        assert!(matches!(
            conn.transaction(&["missing"], TransactionMode::ReadOnly),
            Err(StorageError::NotFound(_))
        ));

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadOnly)
            .unwrap();
        let store = tx.object_store("items").unwrap();
        assert_eq!(store.index_names(), vec!["byTag".to_string()]);
        assert!(matches!(store.index("byText"), Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_explicit_abort_fails_queued_requests() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadWrite)
            .unwrap();
        let request = tx
            .object_store("items")
            .unwrap()
            .add(json!({"tag": "x"}))
            .unwrap();
        let (err_tx, err_rx) = oneshot::channel();
        request.on_error(move |e| {
            let _ = err_tx.send(e.name());
        });
        tx.abort();

        assert_eq!(err_rx.await.unwrap(), "AbortError");
        assert!(request.result().is_none());
    }

    #[tokio::test]
    async fn test_requests_after_commit_are_inactive() {
        let factory = Factory::new(Database::open_in_memory().unwrap());
        let conn = notes_connection(&factory).await;

        let tx = conn
            .transaction(&["items"], TransactionMode::ReadWrite)
            .unwrap();
        let store = tx.object_store("items").unwrap();
        tx.commit();

        assert!(matches!(
            store.add(json!({"tag": "x"})),
            Err(StorageError::TransactionInactive)
        ));
    }
}
