use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// One-shot, idempotent shutdown broadcast.
///
/// The flag answers "has shutdown started" without awaiting; the broadcast
/// wakes every task currently parked in [`Shutdown::wait`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    triggered: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Signal shutdown. Returns `true` only for the call that flipped the flag.
    pub fn trigger(&self) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.shutdown_tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        // Subscribe before checking the flag so a concurrent trigger is never missed
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = shutdown_rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
