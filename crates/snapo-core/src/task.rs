//! Cancellable background tasks

use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// A spawned loop paired with its shutdown channel
///
/// The loop receives a shutdown receiver and is expected to `select!` on it
/// at its suspension points. [`TaskHandle::cancel`] signals and then waits
/// for the loop to exit.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskHandle {
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(task(shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub(crate) async fn cancel(self) {
        // The loop may already have exited on its own
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Background task panicked: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
