//! One-shot async event used for `started`/`synced`/`ready` signals.

use std::sync::Arc;

use tokio::sync::watch;

/// A latch that can be set once and awaited by any number of tasks.
#[derive(Debug, Clone)]
pub struct Event {
    tx: Arc<watch::Sender<bool>>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the latch. Idempotent.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // the sender lives in self, so changed() cannot fail here
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
