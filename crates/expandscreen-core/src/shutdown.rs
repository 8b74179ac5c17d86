//! Cooperative cancellation shared by the long-running loops.

use tokio::sync::watch;

/// Trigger half. Dropping it also releases waiters.
pub struct ShutdownGuard {
    tx: watch::Sender<bool>,
}

impl ShutdownGuard {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Waiter half, cheap to clone into every task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (ShutdownGuard, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownGuard { tx }, Shutdown { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is triggered (or the guard is dropped).
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
