//! Factory and the versioned open protocol
//!
//! Open requests for one database are served in arrival order:
//!
//! ```text
//! requested < stored             -> error (VersionError)
//! requested == stored            -> success
//! requested > stored, others open -> blocked (once), wait for them to close
//!                                    or leave the queue if withdrawn
//! requested > stored             -> upgrade needed -> commit -> success
//!                                                  -> abort  -> error
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::database::Database;
use crate::error::StorageError;
use crate::event_loop::EventLoop;
use crate::upgrade::VersionChange;
use crate::Result;

type SuccessCallback = Box<dyn FnOnce(Connection) + Send + 'static>;
type ErrorCallback = Box<dyn FnOnce(StorageError) + Send + 'static>;
type BlockedCallback = Box<dyn FnOnce(u64, u64) + Send + 'static>;
type UpgradeCallback = Box<dyn FnOnce(VersionChange) + Send + 'static>;

/// Event handlers for one open request
#[derive(Default)]
pub struct OpenCallbacks {
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    on_blocked: Option<BlockedCallback>,
    on_upgrade_needed: Option<UpgradeCallback>,
    withdraw_on_blocked: bool,
}

impl OpenCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired with the open connection once no version change is pending
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Connection) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(StorageError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Fired with (stored, requested) versions when open connections hold
    /// up an upgrade. The request stays queued until they close.
    pub fn on_blocked<F>(mut self, f: F) -> Self
    where
        F: FnOnce(u64, u64) + Send + 'static,
    {
        self.on_blocked = Some(Box::new(f));
        self
    }

    /// Leave the queue once blocked instead of waiting, so requests behind
    /// this one are served. Nothing fires after `on_blocked`.
    pub fn withdraw_on_blocked(mut self) -> Self {
        self.withdraw_on_blocked = true;
        self
    }

    /// Fired with the version-change window when the requested version is
    /// higher than the stored one
    pub fn on_upgrade_needed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(VersionChange) + Send + 'static,
    {
        self.on_upgrade_needed = Some(Box::new(f));
        self
    }
}

struct PendingOpen {
    version: u64,
    callbacks: OpenCallbacks,
}

#[derive(Default)]
struct DbSlot {
    open: HashSet<u64>,
    upgrading: bool,
    pending: VecDeque<PendingOpen>,
}

enum Step {
    Fail(PendingOpen, StorageError),
    Open(PendingOpen, Connection),
    Upgrade(PendingOpen, Connection, u64),
    Blocked(BlockedCallback, u64, u64),
    Withdrawn(Option<BlockedCallback>, u64, u64),
    Wait,
}

pub(crate) struct FactoryInner {
    pub db: Database,
    pub events: EventLoop,
    registry: Mutex<HashMap<String, DbSlot>>,
    next_connection_id: AtomicU64,
}

impl FactoryInner {
    /// Serve queued open requests for `name` until one has to wait
    fn pump(self: &Arc<Self>, name: &str) {
        loop {
            match self.next_step(name) {
                Step::Wait => return,
                Step::Fail(open, error) => {
                    tracing::debug!(db = %name, error = %error, "Open request failed");
                    match open.callbacks.on_error {
                        Some(cb) => self.events.queue(move || cb(error)),
                        None => tracing::warn!(db = %name, "Unhandled open error: {}", error),
                    }
                }
                Step::Open(open, connection) => {
                    tracing::debug!(db = %name, version = open.version, "Opened database");
                    if let Some(cb) = open.callbacks.on_success {
                        self.events.queue(move || cb(connection));
                    }
                }
                Step::Upgrade(open, connection, old_version) => {
                    tracing::info!(
                        db = %name,
                        old_version,
                        new_version = open.version,
                        "Upgrade needed"
                    );
                    let PendingOpen { callbacks, .. } = open;
                    let OpenCallbacks {
                        on_success,
                        on_error,
                        on_upgrade_needed,
                        ..
                    } = callbacks;
                    let completion = OpenCallbacks {
                        on_success,
                        on_error,
                        ..OpenCallbacks::default()
                    };
                    let change =
                        VersionChange::new(Arc::clone(self), connection, old_version, completion);
                    match on_upgrade_needed {
                        Some(cb) => self.events.queue(move || cb(change)),
                        None => change.commit(),
                    }
                    // the rest of the queue waits for the upgrade
                    return;
                }
                Step::Blocked(cb, old_version, new_version) => {
                    tracing::info!(db = %name, old_version, new_version, "Open blocked");
                    self.events.queue(move || cb(old_version, new_version));
                    return;
                }
                Step::Withdrawn(cb, old_version, new_version) => {
                    tracing::info!(
                        db = %name,
                        old_version,
                        new_version,
                        "Blocked open withdrawn"
                    );
                    if let Some(cb) = cb {
                        self.events.queue(move || cb(old_version, new_version));
                    }
                }
            }
        }
    }

    fn next_step(self: &Arc<Self>, name: &str) -> Step {
        let mut registry = self.registry.lock();
        let Some(slot) = registry.get_mut(name) else {
            return Step::Wait;
        };
        if slot.upgrading {
            return Step::Wait;
        }
        let Some(requested) = slot.pending.front().map(|open| open.version) else {
            if slot.open.is_empty() {
                registry.remove(name);
            }
            return Step::Wait;
        };

        let stored = match self.db.stored_version(name) {
            Ok(v) => v,
            Err(e) => return fail_front(slot, e),
        };

        if requested < stored {
            return fail_front(
                slot,
                StorageError::Version {
                    requested,
                    stored,
                },
            );
        }

        if requested > stored && !slot.open.is_empty() {
            if slot
                .pending
                .front()
                .is_some_and(|open| open.callbacks.withdraw_on_blocked)
            {
                return match slot.pending.pop_front() {
                    Some(open) => Step::Withdrawn(open.callbacks.on_blocked, stored, requested),
                    None => Step::Wait,
                };
            }
            let blocked = slot
                .pending
                .front_mut()
                .and_then(|open| open.callbacks.on_blocked.take());
            return match blocked {
                Some(cb) => Step::Blocked(cb, stored, requested),
                None => Step::Wait,
            };
        }

        let catalog = match self.db.load_catalog(name) {
            Ok(catalog) => catalog,
            Err(e) => return fail_front(slot, e),
        };

        let Some(open) = slot.pending.pop_front() else {
            return Step::Wait;
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        slot.open.insert(id);

        let upgrading = requested > stored;
        let connection = Connection::new(
            Arc::clone(self),
            id,
            name.to_string(),
            requested,
            catalog,
            upgrading,
        );

        if upgrading {
            slot.upgrading = true;
            Step::Upgrade(open, connection, stored)
        } else {
            Step::Open(open, connection)
        }
    }

    /// Called from the event loop when the last handle of a connection drops
    pub(crate) fn close(self: &Arc<Self>, name: &str, id: u64) {
        if let Some(slot) = self.registry.lock().get_mut(name) {
            slot.open.remove(&id);
        }
        tracing::debug!(db = %name, connection = id, "Connection closed");
        self.pump(name);
    }

    /// End of a version change; an aborted upgrade also releases its
    /// connection so queued requests are not blocked by it
    pub(crate) fn upgrade_finished(self: &Arc<Self>, name: &str, released: Option<u64>) {
        if let Some(slot) = self.registry.lock().get_mut(name) {
            slot.upgrading = false;
            if let Some(id) = released {
                slot.open.remove(&id);
            }
        }
        self.pump(name);
    }
}

fn fail_front(slot: &mut DbSlot, error: StorageError) -> Step {
    match slot.pending.pop_front() {
        Some(open) => Step::Fail(open, error),
        None => Step::Wait,
    }
}

/// Entry point to the engine, one per backing [`Database`]
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

impl Factory {
    /// Create a factory over `db`. Must be called from within a Tokio
    /// runtime, which hosts the event loop.
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                db,
                events: EventLoop::spawn(),
                registry: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Request a connection to `name` at `version`.
    ///
    /// Returns an error immediately for version 0; every other outcome is
    /// reported through `callbacks`.
    pub fn open(&self, name: &str, version: u64, callbacks: OpenCallbacks) -> Result<()> {
        if version == 0 {
            return Err(StorageError::Type("version must be at least 1".to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        self.inner.events.queue(move || {
            inner
                .registry
                .lock()
                .entry(name.clone())
                .or_default()
                .pending
                .push_back(PendingOpen { version, callbacks });
            inner.pump(&name);
        });

        Ok(())
    }

    /// Names and stored versions of all databases
    pub fn databases(&self) -> Result<Vec<(String, u64)>> {
        self.inner.db.databases()
    }
}
