//! Wrapper around a `yrs::Doc`/`Awareness` pair.
//!
//! Every committed transaction on the document is mirrored into a bounded
//! update channel through a v1 update observer; the subscription handle
//! detaches the observer when dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::Awareness;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

/// Capacity of the update channel between a document and its broadcast task.
pub const UPDATE_CHANNEL_SIZE: usize = 65536;

/// Failure while decoding or applying CRDT payloads.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(#[from] yrs::encoding::read::Error),
    #[error("failed to apply update: {0}")]
    Apply(#[from] yrs::error::UpdateError),
    #[error("failed to apply awareness update: {0}")]
    Awareness(String),
    #[error("failed to install update observer: {0}")]
    Observe(String),
}

/// A CRDT document together with its awareness state.
///
/// Clones share the same underlying document; the handle is cheap to pass
/// between tasks.
#[derive(Clone)]
pub struct YDocHandle {
    doc: Doc,
    awareness: Arc<Awareness>,
}

impl YDocHandle {
    pub fn new() -> Self {
        let doc = Doc::new();
        let awareness = Arc::new(Awareness::new(doc.clone()));
        Self { doc, awareness }
    }

    /// The underlying document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The awareness state sharing this document's lifetime.
    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// Encode the document's state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the updates a peer with `state_vector` is missing.
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Encode the full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply a remote update to the document.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)?;
        Ok(())
    }

    /// Merge an awareness payload into the local awareness state.
    pub fn apply_awareness_update(&self, payload: &[u8]) -> Result<(), DocError> {
        let update = AwarenessUpdate::decode_v1(payload)?;
        self.awareness
            .apply_update_summary(update)
            .map_err(|e| DocError::Awareness(e.to_string()))?;
        Ok(())
    }

    /// Mirror every committed update into `tx`.
    ///
    /// The observer runs synchronously inside the commit. A full channel
    /// back-pressures the producer: the commit blocks until the consumer
    /// drains a slot. Only a closed channel (consumer gone) drops updates.
    pub fn subscribe_updates(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<Subscription, DocError> {
        self.doc
            .observe_update_v1(move |_txn, event| push_update(&tx, event.update.clone()))
            .map_err(|e| DocError::Observe(e.to_string()))
    }
}

/// Hand one committed update to the channel from inside the commit path.
fn push_update(tx: &mpsc::Sender<Vec<u8>>, update: Vec<u8>) {
    match tx.try_send(update) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(update)) => {
            // park the committing thread until the consumer drains; commits
            // are serialized per document, so ordering is preserved
            if futures::executor::block_on(tx.send(update)).is_err() {
                debug!("update channel closed, dropping committed update");
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("update channel closed, dropping committed update");
        }
    }
}

impl Default for YDocHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn insert_text(handle: &YDocHandle, content: &str) {
        let text = handle.doc().get_or_insert_text("content");
        let mut txn = handle.doc().transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }

    #[test]
    fn test_diff_and_apply_converge() {
        let a = YDocHandle::new();
        let b = YDocHandle::new();

        insert_text(&a, "hello");
        let diff = a.diff(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();

        let text = b.doc().get_or_insert_text("content");
        assert_eq!(text.get_string(&b.doc().transact()), "hello");
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = YDocHandle::new();
        let b = YDocHandle::new();

        insert_text(&a, "once");
        let update = a.encode_state_as_update();
        b.apply_update(&update).unwrap();
        b.apply_update(&update).unwrap();

        assert_eq!(a.encode_state_as_update(), b.encode_state_as_update());
    }

    #[tokio::test]
    async fn test_observer_mirrors_commits() {
        let handle = YDocHandle::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _sub = handle.subscribe_updates(tx).unwrap();

        insert_text(&handle, "observed");

        let update = rx.recv().await.unwrap();
        let other = YDocHandle::new();
        other.apply_update(&update).unwrap();
        let text = other.doc().get_or_insert_text("content");
        assert_eq!(text.get_string(&other.doc().transact()), "observed");
    }

    #[tokio::test]
    async fn test_full_channel_blocks_commit_until_drained() {
        let handle = YDocHandle::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _sub = handle.subscribe_updates(tx).unwrap();

        insert_text(&handle, "first");

        // the channel is full, so this commit must block inside the observer
        let blocked = {
            let handle = handle.clone();
            std::thread::spawn(move || insert_text(&handle, "second"))
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // draining one slot releases the commit
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        blocked.join().unwrap();

        let replica = YDocHandle::new();
        replica.apply_update(&first).unwrap();
        replica.apply_update(&second).unwrap();
        let text = replica.doc().get_or_insert_text("content");
        assert_eq!(text.get_string(&replica.doc().transact()), "firstsecond");
    }

    #[tokio::test]
    async fn test_dropping_subscription_detaches() {
        let handle = YDocHandle::new();
        let (tx, mut rx) = mpsc::channel(16);
        let sub = handle.subscribe_updates(tx).unwrap();
        drop(sub);

        insert_text(&handle, "silent");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let handle = YDocHandle::new();
        assert!(handle.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
