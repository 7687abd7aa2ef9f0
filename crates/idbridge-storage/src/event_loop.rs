//! Cooperative event loop
//!
//! Every engine event runs as a task on one Tokio task, in the order it was
//! queued. A transaction executes inside a single task, which is what
//! serializes read-write transactions.

use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct EventLoop {
    tx: mpsc::UnboundedSender<Task>,
}

impl EventLoop {
    /// Start the loop. Must be called from within a Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
                // let other tasks observe what this one resolved
                tokio::task::yield_now().await;
            }
            tracing::debug!("Event loop stopped");
        });

        Self { tx }
    }

    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            tracing::warn!("Event loop is gone, dropping task");
        }
    }
}
