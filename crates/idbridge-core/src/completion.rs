//! Single-assignment completion
//!
//! Engine callbacks may fire several times for one logical outcome (one
//! error event per failed request, then an abort). A `Resolver` hands the
//! first value to the waiting future and discards the rest.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use idbridge_storage::{Request, Transaction};

pub(crate) struct Resolver<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
    late: Arc<AtomicUsize>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            late: Arc::clone(&self.late),
        }
    }
}

impl<T> Resolver<T> {
    /// Deliver `value` if nothing was delivered yet. A late value is dropped
    /// here, which releases whatever engine handle it carries.
    pub fn resolve(&self, value: T) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => {
                let late = self.late.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(late, "Discarding late resolution");
                false
            }
        }
    }

    /// Number of values that arrived after the first one
    #[cfg(test)]
    pub fn late_resolutions(&self) -> usize {
        self.late.load(Ordering::Relaxed)
    }
}

pub(crate) struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    /// Wait for the first resolution. `None` when every resolver was dropped
    /// without resolving.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

pub(crate) fn channel<T>() -> (Resolver<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver {
            slot: Arc::new(Mutex::new(Some(tx))),
            late: Arc::new(AtomicUsize::new(0)),
        },
        Completion { rx },
    )
}

/// Resolve with the request's result or the first error it reports
pub(crate) fn watch_request<T>(request: &Request<T>) -> Completion<Result<T, String>>
where
    T: Clone + Send + 'static,
{
    let (resolver, completion) = channel();

    let on_success = resolver.clone();
    request.on_success(move |value| {
        on_success.resolve(Ok(value));
    });
    request.on_error(move |error| {
        resolver.resolve(Err(error.to_string()));
    });

    completion
}

/// Resolve once the transaction completes, errors or aborts
pub(crate) fn watch_transaction(
    tx: &Transaction,
) -> (Resolver<Result<(), String>>, Completion<Result<(), String>>) {
    let (resolver, completion) = channel();

    let on_complete = resolver.clone();
    tx.on_complete(move || {
        on_complete.resolve(Ok(()));
    });
    let on_error = resolver.clone();
    tx.on_error(move |error| {
        on_error.resolve(Err(error.to_string()));
    });
    let on_abort = resolver.clone();
    tx.on_abort(move |error| {
        on_abort.resolve(Err(error.to_string()));
    });

    (resolver, completion)
}
